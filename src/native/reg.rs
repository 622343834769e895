// src/native/reg.rs

//! `reg.exe` offline hive loader
//!
//! ```text
//! reg load   HKLM\<key> <hive file>
//! reg add    HKLM\<key>\<path> /v <name> /t <type> /d <data> /f
//! reg delete HKLM\<key>\<path> /v <name> /f
//! reg delete HKLM\<key>\<path> /f
//! reg unload HKLM\<key>
//! ```

use super::{HiveLoader, RegValue, run_tool};
use crate::{NativeOperation, Result};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const REG: &str = "reg";

/// Root under which offline hives are loaded
const LOAD_ROOT: &str = "HKLM";

#[derive(Debug, Clone)]
pub struct RegHiveLoader {
    timeout: Duration,
}

impl RegHiveLoader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn reg(&self, operation: NativeOperation, args: Vec<String>) -> Result<()> {
        run_tool(REG, &args, self.timeout, operation)?;
        Ok(())
    }
}

/// Full `HKLM\<load_key>[\<key>]` path
pub fn full_key(load_key: &str, key: &str) -> String {
    let key = key.trim_matches('\\');
    if key.is_empty() {
        format!("{}\\{}", LOAD_ROOT, load_key)
    } else {
        format!("{}\\{}\\{}", LOAD_ROOT, load_key, key)
    }
}

/// Value-name arguments; the empty name addresses the default value
fn value_name_args(name: &str) -> Vec<String> {
    if name.is_empty() {
        vec!["/ve".to_string()]
    } else {
        vec!["/v".to_string(), name.to_string()]
    }
}

impl HiveLoader for RegHiveLoader {
    fn name(&self) -> &str {
        REG
    }

    fn load(&self, load_key: &str, backing: &Path) -> Result<()> {
        debug!("Loading hive {} as {}", backing.display(), full_key(load_key, ""));
        self.reg(
            NativeOperation::HiveLoad,
            vec![
                "load".to_string(),
                full_key(load_key, ""),
                backing.display().to_string(),
            ],
        )
    }

    fn unload(&self, load_key: &str) -> Result<()> {
        debug!("Unloading hive {}", full_key(load_key, ""));
        self.reg(
            NativeOperation::HiveUnload,
            vec!["unload".to_string(), full_key(load_key, "")],
        )
    }

    fn set_value(&self, load_key: &str, key: &str, name: &str, value: &RegValue) -> Result<()> {
        let mut args = vec!["add".to_string(), full_key(load_key, key)];
        args.extend(value_name_args(name));
        args.extend([
            "/t".to_string(),
            value.reg_type().to_string(),
            "/d".to_string(),
            value.reg_data(),
            "/f".to_string(),
        ]);
        self.reg(NativeOperation::HiveEdit, args)
    }

    fn delete_value(&self, load_key: &str, key: &str, name: &str) -> Result<()> {
        let mut args = vec!["delete".to_string(), full_key(load_key, key)];
        args.extend(value_name_args(name));
        args.push("/f".to_string());
        self.reg(NativeOperation::HiveEdit, args)
    }

    fn delete_key(&self, load_key: &str, key: &str) -> Result<()> {
        self.reg(
            NativeOperation::HiveEdit,
            vec!["delete".to_string(), full_key(load_key, key), "/f".to_string()],
        )
    }
}

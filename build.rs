// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: module ids
fn module_arg() -> Arg {
    Arg::new("module")
        .short('m')
        .long("module")
        .value_name("ID")
        .value_delimiter(',')
        .action(ArgAction::Append)
        .help("Module ids to enable (comma-separated or repeated)")
}

/// Common argument: run id
fn run_id_arg() -> Arg {
    Arg::new("run_id").required(true).help("Run id")
}

fn build_cli() -> Command {
    Command::new("wimsmith")
        .version(env!("CARGO_PKG_VERSION"))
        .author("wimsmith Contributors")
        .about("Offline Windows image customizer with checkpoints and rollback")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Configuration file (default: <config dir>/wimsmith/config.toml)"),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Use the simulated backend instead of DISM"),
        )
        .arg(
            Arg::new("state_dir")
                .long("state-dir")
                .value_name("PATH")
                .global(true)
                .help("Override the state directory from the configuration"),
        )
        .arg(
            Arg::new("catalog")
                .long("catalog")
                .value_name("PATH")
                .global(true)
                .help("Module catalog (default: <config dir>/wimsmith/modules.toml)"),
        )
        .subcommand(
            Command::new("run")
                .about("Customize an image with the selected modules")
                .arg(Arg::new("image").required(true).help("Image file (WIM, ESD, VHD, VHDX)"))
                .arg(
                    Arg::new("index")
                        .short('i')
                        .long("index")
                        .default_value("1")
                        .help("Image index inside the file"),
                )
                .arg(module_arg())
                .arg(
                    Arg::new("critical")
                        .long("critical")
                        .value_delimiter(',')
                        .help("Treat exactly these module ids as critical"),
                )
                .arg(Arg::new("format").long("format").help("Image format (wim, esd, vhd, vhdx)"))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the run result as JSON"),
                )
                .arg(
                    Arg::new("no_recover")
                        .long("no-recover")
                        .action(ArgAction::SetTrue)
                        .help("Skip stale mount recovery before the run"),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Show the module order a run would use")
                .arg(module_arg()),
        )
        .subcommand(Command::new("modules").about("List registered modules"))
        .subcommand(
            Command::new("recover")
                .about("Discard stale mounts and abandon checkpoints of crashed runs"),
        )
        .subcommand(
            Command::new("checkpoint")
                .about("Checkpoint management")
                .subcommand_required(true)
                .subcommand(
                    Command::new("list").about("List checkpoints").arg(
                        Arg::new("pending")
                            .long("pending")
                            .action(ArgAction::SetTrue)
                            .help("Only pending checkpoints"),
                    ),
                )
                .subcommand(Command::new("show").about("Show one checkpoint").arg(run_id_arg()))
                .subcommand(
                    Command::new("verify")
                        .about("Re-hash the image and compare with the checkpoint")
                        .arg(run_id_arg()),
                )
                .subcommand(
                    Command::new("prune")
                        .about("Remove finalized checkpoints older than the retention window")
                        .arg(Arg::new("days").long("days").help("Retention in days")),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("wimsmith.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}

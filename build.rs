// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: configuration file
fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .global(true)
        .help("Configuration file (defaults plus environment when omitted)")
}

fn build_cli() -> Command {
    Command::new("catalog-sync")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Keep a local catalog database in sync with its remote source")
        .subcommand_required(true)
        .arg(config_arg())
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .default_value("info")
                .global(true)
                .help("Default log level when RUST_LOG is unset"),
        )
        .subcommand(Command::new("check").about("Run the regular check and update if the remote changed"))
        .subcommand(Command::new("update").about("Update now, ignoring the check interval"))
        .subcommand(Command::new("status").about("Print the sync status as JSON"))
        .subcommand(
            Command::new("validate")
                .about("Run the integrity checks against a file")
                .arg(Arg::new("file").required(true).help("Candidate database file")),
        )
        .subcommand(
            Command::new("serve")
                .about("Serve the manual trigger over HTTP")
                .arg(
                    Arg::new("bind")
                        .short('b')
                        .long("bind")
                        .help("Listen address (overrides trigger.bind)"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=OUT_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = out_dir.join("man");

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

    let man_path = man_dir.join("catalog-sync.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}

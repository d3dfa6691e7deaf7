// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

// Operator keystore tool for the service chain bridge

use anyhow::Result;
use bridge_keys::{
    format_address, init_operator_keystore, open_operator_keystore, public_key_to_address,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bridge-keygen")]
#[command(about = "Manage operator keystores of the service chain bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the parent and child operator keystores under a data dir
    Init {
        /// Bridge data directory
        #[arg(short, long)]
        data_dir: PathBuf,
    },
    /// Print the operator address stored in a keystore directory
    Examine {
        /// Keystore directory
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { data_dir } => {
            for side in ["parent_bridge_account", "child_bridge_account"] {
                let key = init_operator_keystore(&data_dir.join(side))?;
                println!("{}: {}", side, format_address(&key.address()));
            }
        }
        Commands::Examine { path } => {
            let key = open_operator_keystore(&path)?;
            let derived = public_key_to_address(key.wallet.signer().verifying_key());
            println!("Key file: {:?}", key.key_path);
            println!("Operator address: {}", format_address(&derived));
        }
    }

    Ok(())
}

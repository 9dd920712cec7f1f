//! Generates software signer key files for development and test wallets.
//!
//! Each file holds the account-level xprv at the path the coordinator
//! expects for the chosen wallet shape. Enroll with
//! `coordinator add-signer <wallet> <name> --key-file <name>.json`.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use multisig_coordinator::descriptor::account_path;
use multisig_coordinator::{Network, ScriptType, SignerDevice, SoftwareSigner, WalletType};
use rand::RngCore;

#[derive(Parser)]
#[command(name = "keygen", about = "Generate software signer key files")]
struct Args {
    /// Signer names; one key file per name
    #[arg(required = true)]
    names: Vec<String>,

    #[arg(long, default_value = "regtest")]
    network: Network,

    #[arg(long, default_value = "native")]
    script_type: ScriptType,

    #[arg(long, default_value = "multi")]
    wallet_type: WalletType,

    /// Directory the key files are written to
    #[arg(short, long, default_value = ".")]
    out: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let path = account_path(args.script_type, args.wallet_type, args.network);

    println!("Network: {}, Path: {}\n", args.network, path);
    fs::create_dir_all(&args.out)?;

    for name in &args.names {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);

        let signer = SoftwareSigner::from_seed(name, args.network.to_bitcoin(), &seed, &path)?;
        let filename = args.out.join(format!("{name}.json"));
        fs::write(&filename, serde_json::to_string_pretty(&signer.key_data())?)?;
        println!("{}: {} -> {}", name, signer.fingerprint()?, filename.display());
    }

    println!("\nKeys generated. Keep xprv secret, share only xpub with coordinator.");
    Ok(())
}

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bitcoin::{Amount, Denomination};
use clap::{Parser, Subcommand};
use multisig_coordinator::config::{self, Config};
use multisig_coordinator::device::DeviceInfo;
use multisig_coordinator::psbt::summarize;
use multisig_coordinator::{
    Context, DeviceType, HwiDevice, NewWallet, Payment, SignerDevice, Snapshot, SoftwareSigner, WalletRecord,
    WalletType,
};

#[derive(Parser)]
#[command(name = "coordinator")]
#[command(about = "Coordinates m-of-n multisig wallets backed by Bitcoin Core", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.multisig-coordinator/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new wallet
    Create {
        name: String,
        /// Signatures required
        #[arg(short)]
        m: usize,
        /// Total signers
        #[arg(short)]
        n: usize,
        /// single or multi
        #[arg(long, default_value = "multi")]
        wallet_type: WalletType,
    },

    /// Enroll a signer from a key file or a connected hardware device
    AddSigner {
        wallet: String,
        name: String,
        #[arg(long, conflicts_with = "device")]
        key_file: Option<PathBuf>,
        /// Fingerprint or HWI path of the device
        #[arg(long)]
        device: Option<String>,
    },

    /// Show a wallet's parameters, signers and psbts
    Describe { wallet: String },

    /// List stored wallets
    List,

    /// Issue the next receiving (or change) address
    Address {
        wallet: String,
        #[arg(long)]
        change: bool,
    },

    /// Re-register issued addresses with the node
    Sync {
        wallet: String,
        #[arg(long)]
        rescan: bool,
    },

    /// Fund a payment and store the psbt
    CreatePsbt {
        wallet: String,
        address: String,
        /// Amount in BTC
        amount: String,
        #[arg(long)]
        subtract_fee: bool,
    },

    /// List stored psbts with their outputs and signing state
    Psbts { wallet: String },

    /// Sign a stored psbt
    Sign {
        wallet: String,
        index: usize,
        #[arg(long, conflicts_with = "device")]
        key_file: Option<PathBuf>,
        #[arg(long)]
        device: Option<String>,
    },

    /// Merge signatures from a psbt signed elsewhere (base64)
    Combine {
        wallet: String,
        index: usize,
        psbt: String,
    },

    /// Drop a stored psbt without broadcasting it
    Remove { wallet: String, index: usize },

    /// Finalize and broadcast a fully signed psbt
    Broadcast { wallet: String, index: usize },

    /// Resolve psbts left behind by an interrupted broadcast
    Reconcile { wallet: String },

    /// Show the watch-only balance
    Balance { wallet: String },

    /// Show recent wallet transactions
    History {
        wallet: String,
        #[arg(long, default_value_t = 20)]
        count: usize,
    },

    /// List connected hardware devices
    Devices,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    config::init_logging(cli.debug);

    let config = Config::load(&cli.config.unwrap_or_else(Config::default_path))?;
    let ctx = Context {
        store: Arc::new(config.store()?),
        connector: Arc::new(config.connector()),
        address_window: config.wallet.address_window,
    };

    match cli.command {
        Commands::Create {
            name,
            m,
            n,
            wallet_type,
        } => {
            let wallet = WalletRecord::create(
                &ctx,
                NewWallet {
                    node: config.node(&name),
                    name,
                    m,
                    n,
                    network: config.wallet.network,
                    script_type: config.wallet.script_type,
                    wallet_type,
                },
            )?;
            println!("Created {}-of-{} wallet \"{}\"", wallet.m(), wallet.n(), wallet.name());
            println!("Signers export their xpub at {}", wallet.account_path());
        }

        Commands::AddSigner {
            wallet,
            name,
            key_file,
            device,
        } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            let signer = match (key_file, device) {
                (Some(path), _) => wallet.enroll(&name, &SoftwareSigner::from_key_file(path)?)?,
                (None, selector) => wallet.enroll(&name, &open_device(&config, selector.as_deref())?)?,
            };
            println!("Added {} [{}] {}", signer.name, signer.fingerprint, signer.device_type);
            if wallet.ready() {
                println!("Wallet is ready");
            } else {
                println!("{} of {} signers enrolled", wallet.signers().len(), wallet.n());
            }
        }

        Commands::Describe { wallet } => {
            let wallet = WalletRecord::open(&ctx, &wallet)?;
            println!("{}", serde_json::to_string_pretty(&wallet.describe())?);
        }

        Commands::List => {
            for name in WalletRecord::list(&ctx)? {
                println!("{name}");
            }
        }

        Commands::Address { wallet, change } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            println!("{}", wallet.derive_address(change)?);
        }

        Commands::Sync { wallet, rescan } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            let repaired = wallet.sync(rescan)?;
            println!("Re-registered {repaired} addresses");
        }

        Commands::CreatePsbt {
            wallet,
            address,
            amount,
            subtract_fee,
        } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            let amount = Amount::from_str_in(&amount, Denomination::Bitcoin)?;
            let subtract: &[usize] = if subtract_fee { &[0] } else { &[] };
            let index = wallet.create_psbt(&[Payment { address, amount }], subtract)?;
            println!("Created psbt {index}");
            println!("{}", multisig_coordinator::psbt::encode(wallet.psbt(index)?));
        }

        Commands::Psbts { wallet } => {
            let wallet = WalletRecord::open(&ctx, &wallet)?;
            for (index, entry) in wallet.psbts().entries().iter().enumerate() {
                let summary = summarize(&entry.psbt, wallet.network().to_bitcoin());
                println!("[{index}] {}  {:?}", summary.txid, entry.status(wallet.m()));
                for output in &summary.outputs {
                    println!("      {} {}", output.address.as_deref().unwrap_or("<non-standard>"), output.amount);
                }
                if let Some(fee) = summary.fee {
                    println!("      fee {fee}");
                }
            }
        }

        Commands::Sign {
            wallet,
            index,
            key_file,
            device,
        } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            let status = match (key_file, device) {
                (Some(path), _) => wallet.sign_psbt(index, &SoftwareSigner::from_key_file(path)?)?,
                (None, selector) => wallet.sign_psbt(index, &open_device(&config, selector.as_deref())?)?,
            };
            println!("psbt {index}: {status:?}");
        }

        Commands::Combine { wallet, index, psbt } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            let status = wallet.combine_psbt(index, multisig_coordinator::psbt::decode(&psbt)?)?;
            println!("psbt {index}: {status:?}");
        }

        Commands::Remove { wallet, index } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            wallet.remove_psbt(index)?;
            println!("Removed psbt {index}");
        }

        Commands::Broadcast { wallet, index } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            println!("{}", wallet.broadcast(index)?);
        }

        Commands::Reconcile { wallet } => {
            let mut wallet = WalletRecord::open(&ctx, &wallet)?;
            let outcome = wallet.reconcile()?;
            for txid in outcome.confirmed {
                println!("{txid}: known to node, removed");
            }
            for txid in outcome.reverted {
                println!("{txid}: unknown to node, back to signing");
            }
        }

        Commands::Balance { wallet } => {
            let wallet = WalletRecord::open(&ctx, &wallet)?;
            match wallet.balances()? {
                Snapshot::Live(balance) => {
                    println!("Confirmed:   {}", balance.trusted);
                    println!("Unconfirmed: {}", balance.untrusted_pending);
                    println!("Immature:    {}", balance.immature);
                }
                Snapshot::Unavailable => println!("Balance unavailable: node unreachable"),
            }
        }

        Commands::History { wallet, count } => {
            let wallet = WalletRecord::open(&ctx, &wallet)?;
            match wallet.history(count)? {
                Snapshot::Live(transactions) => {
                    for tx in transactions {
                        let address = tx.address.as_deref().unwrap_or("-");
                        println!(
                            "{}  {:<8} {:>16}  {} ({} conf)",
                            tx.txid, tx.category, tx.amount, address, tx.confirmations
                        );
                    }
                }
                Snapshot::Unavailable => println!("History unavailable: node unreachable"),
            }
        }

        Commands::Devices => {
            for device in config.hwi().enumerate()? {
                print_device(&device);
            }
        }
    }

    Ok(())
}

fn print_device(device: &DeviceInfo) {
    let fingerprint = device.fingerprint.as_deref().unwrap_or("--------");
    let mut flags = Vec::new();
    if device.needs_pin_sent {
        flags.push("needs pin");
    }
    if device.needs_passphrase_sent {
        flags.push("needs passphrase");
    }
    if device.family().is_none() {
        flags.push("unsupported");
    }
    println!("{fingerprint}  {:<10} {}  {}", device.device_type, device.path, flags.join(", "));
}

/// Opens the single connected device, or the one matching `selector`, and
/// unlocks it if it asks for a pin.
fn open_device(config: &Config, selector: Option<&str>) -> Result<HwiDevice, Box<dyn std::error::Error>> {
    let hwi = config.hwi();
    let devices = hwi.enumerate()?;
    let info = match selector {
        Some(selector) => devices
            .iter()
            .find(|d| d.fingerprint.as_deref() == Some(selector) || d.path == selector)
            .ok_or_else(|| format!("no device matches \"{selector}\""))?,
        None => match devices.as_slice() {
            [only] => only,
            [] => return Err("no hardware device connected".into()),
            _ => return Err("several devices connected, pick one with --device".into()),
        },
    };

    let device = hwi.open(info)?;
    if info.needs_pin_sent && device.device_type() == DeviceType::Trezor {
        device.prompt_pin()?;
        print!("PIN (as laid out on the device): ");
        io::stdout().flush()?;
        let mut pin = String::new();
        io::stdin().lock().read_line(&mut pin)?;
        device.send_pin(pin.trim())?;
    }
    Ok(device)
}

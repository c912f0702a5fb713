use clap::{Parser, Subcommand};
use inapps::application::client::BillingClient;
use inapps::application::settings::BillingSettings;
use inapps::domain::ports::StorageArc;
use inapps::domain::product::ProductType;
use inapps::infrastructure::in_memory::InMemoryStorage;
use inapps::infrastructure::simulated::{
    ScriptedFlowLauncher, SimulatedBillingService, SimulatedBinder, SimulatedVerifier,
    StoreFixture,
};
use inapps::interfaces::csv::product_list_reader::ProductListReader;
use inapps::interfaces::csv::purchase_writer::PurchaseWriter;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_PACKAGE: &str = "com.example.inapps";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store contents (owned purchases and catalog) for the simulated service
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Billing settings JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB for the purchase cache.
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List owned purchases as CSV
    Purchases {
        #[arg(long = "type", default_value = "inapp")]
        product_type: ProductType,
    },
    /// Print whether a product is owned
    Owned {
        product_id: String,
        #[arg(long = "type", default_value = "inapp")]
        product_type: ProductType,
    },
    /// Print catalog details as CSV
    Sku {
        product_ids: Vec<String>,
        /// CSV file with a product_id column
        #[arg(long)]
        from: Option<PathBuf>,
        #[arg(long = "type", default_value = "inapp")]
        product_type: ProductType,
    },
    /// Buy a product and print the resulting purchase
    Buy {
        product_id: String,
        #[arg(long = "type", default_value = "inapp")]
        product_type: ProductType,
    },
    /// Consume a managed product and print the consumed purchase
    Consume { product_id: String },
}

fn open_storage(db_path: Option<PathBuf>) -> Result<StorageArc> {
    match db_path {
        Some(db_path) => open_persistent(db_path),
        None => Ok(Arc::new(InMemoryStorage::new())),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_persistent(db_path: PathBuf) -> Result<StorageArc> {
    let store = inapps::infrastructure::rocksdb::RocksDbStorage::open(db_path).into_diagnostic()?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_persistent(_db_path: PathBuf) -> Result<StorageArc> {
    eprintln!(
        "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
    );
    Ok(Arc::new(InMemoryStorage::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inapps=info")),
        )
        .with_writer(io::stderr)
        .init();

    let settings = match &cli.config {
        Some(path) => BillingSettings::from_file(path).into_diagnostic()?,
        None => BillingSettings::new(DEFAULT_PACKAGE),
    };
    let fixture = match &cli.fixture {
        Some(path) => StoreFixture::from_file(path).into_diagnostic()?,
        None => StoreFixture::default(),
    };

    let service = Arc::new(SimulatedBillingService::from_fixture(
        settings.package_name.clone(),
        fixture,
    ));
    let binder = SimulatedBinder::new(service.clone());
    let launcher = Arc::new(ScriptedFlowLauncher::new(service));

    // receipts from the simulated store only verify with its own verifier
    let needs_verifier = settings.license_key().is_some();
    let mut builder = BillingClient::builder(settings, Box::new(binder), launcher)
        .storage(open_storage(cli.db_path)?);
    if needs_verifier {
        builder = builder.verifier(Arc::new(SimulatedVerifier));
    }
    let client = builder.build().into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = PurchaseWriter::new(stdout.lock());
    match cli.command {
        Command::Purchases { product_type } => {
            let purchases = client.purchases_map(product_type).await.into_diagnostic()?;
            writer
                .write_purchases(product_type, purchases.values())
                .into_diagnostic()?;
        }
        Command::Owned {
            product_id,
            product_type,
        } => {
            let owned = client
                .is_purchased(&product_id, product_type)
                .await
                .into_diagnostic()?;
            println!("{owned}");
        }
        Command::Sku {
            mut product_ids,
            from,
            product_type,
        } => {
            if let Some(path) = from {
                let file = File::open(path).into_diagnostic()?;
                for id in ProductListReader::new(file).product_ids() {
                    product_ids.push(id.into_diagnostic()?);
                }
            }
            let skus = client
                .sku_details(&product_ids, product_type)
                .await
                .into_diagnostic()?;
            writer.write_skus(&skus).into_diagnostic()?;
        }
        Command::Buy {
            product_id,
            product_type,
        } => {
            let purchase = client
                .purchase(&product_id, product_type)
                .await
                .into_diagnostic()?;
            writer
                .write_purchases(product_type, [&purchase])
                .into_diagnostic()?;
        }
        Command::Consume { product_id } => {
            let purchase = client.consume(&product_id).await.into_diagnostic()?;
            writer
                .write_purchases(ProductType::Managed, [&purchase])
                .into_diagnostic()?;
        }
    }

    Ok(())
}

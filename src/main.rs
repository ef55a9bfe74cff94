use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use morax::config::AppConfig;
use morax::consumer::{Binder, Contract, Stub};
use morax::context::AppContext;
use morax::logging::{self, LogConfig};
use morax::rpc::MethodSet;
use morax::service::Service;

const HELLO_SERVICE: &str = "sample-hello-service";

#[derive(Parser)]
#[command(name = "morax")]
#[command(about = "Lightweight RPC provider/consumer runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $MORAX_CONFIG, then morax.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the sample hello provider until Ctrl-C
    Provider(ProviderArgs),
    /// Call the sample hello provider
    Call(CallArgs),
}

#[derive(Args)]
struct ProviderArgs {
    /// Seconds allowed for draining connections after Ctrl-C
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

#[derive(Args)]
struct CallArgs {
    #[arg(long, default_value = "World")]
    target: String,

    /// Seconds to wait for the provider to show up in the registry
    #[arg(long, default_value_t = 5)]
    discovery_timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloRequest {
    target: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloResponse {
    result: String,
}

struct HelloServiceConsumer {
    hello: Stub<HelloRequest, HelloResponse>,
    bye: Stub<HelloRequest, HelloResponse>,
}

impl Contract for HelloServiceConsumer {
    fn bind(binder: &mut Binder<'_>) -> Self {
        Self {
            hello: binder.slot("Hello"),
            bye: binder.slot("Bye"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.logging.verbose |= cli.verbose;
    logging::init(LogConfig::from(&config.logging))?;

    match cli.command {
        Commands::Provider(args) => {
            config.service.name = HELLO_SERVICE.to_string();
            run_provider(AppContext::with_consul(config), args)
                .await
                .context("Failed to run provider")?
        }
        Commands::Call(args) => run_call(AppContext::with_consul(config), args)
            .await
            .context("Failed to call provider")?,
    }

    Ok(())
}

fn hello_methods() -> MethodSet {
    MethodSet::new()
        .method("Hello", |req: HelloRequest| async move {
            Ok::<_, String>(HelloResponse {
                result: format!("Hello {}", req.target),
            })
        })
        .method("Bye", |req: HelloRequest| async move {
            Ok::<_, String>(HelloResponse {
                result: format!("Bye {}", req.target),
            })
        })
}

async fn run_provider(ctx: AppContext, args: ProviderArgs) -> Result<()> {
    let mut service = Service::new(ctx)?;
    service.init_provider();
    service.register_provider(hello_methods())?;
    service.listen_and_serve().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    let timeout = Duration::from_secs(args.shutdown_timeout);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        deadline.cancel();
    });

    service.shutdown(&cancel).await
}

async fn run_call(ctx: AppContext, args: CallArgs) -> Result<()> {
    let mut service = Service::new(ctx)?;
    service.init_consumer();
    let hello: HelloServiceConsumer = service.register_consumer(HELLO_SERVICE)?;

    if !service
        .wait_for_provider(HELLO_SERVICE, Duration::from_secs(args.discovery_timeout))
        .await
    {
        bail!("no instance of {HELLO_SERVICE} found");
    }

    let request = HelloRequest {
        target: args.target,
    };
    let greeting = hello.hello.call(&request).await?;
    println!("{}", greeting.result);
    let farewell = hello.bye.call(&request).await?;
    println!("{}", farewell.result);

    service.shutdown(&CancellationToken::new()).await
}

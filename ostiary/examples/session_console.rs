use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use ostiary::{
    anomaly::AnomalyObserver,
    events::{FanoutSink, RemoteSink, RemoteSinkConfig, SecurityEventSink, TracingSink},
    limiter::ClientContext,
    remote::{Credentials, HttpCredentialExchange, HttpTokenRenewer},
    store::FileSessionStore,
    AccessError, LifecycleConfig, LoginError, Password, SessionLifecycleController,
    SessionStatus, Signal, SignOutReason, Username,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(about = "Drives a client session from the terminal")]
struct Opts {
    /// The identity server's token renewal URL
    #[arg(long, env)]
    renew_url: reqwest::Url,

    /// The identity server's login URL
    #[arg(long, env)]
    login_url: reqwest::Url,

    /// A collector that receives security events in batches
    #[arg(long, env)]
    audit_url: Option<reqwest::Url>,

    /// The directory holding the persisted session record
    #[arg(long, env, default_value = ".ostiary")]
    session_dir: PathBuf,

    /// A JSON file overriding the default lifecycle configuration
    #[arg(long, env)]
    config: Option<PathBuf>,

    /// The origin reported for login rate limiting
    #[arg(long, env, default_value = "https://admin.example.com")]
    origin: String,
}

const HELP: &str = "commands: login <username> <password> | token | status | focus | online \
                    | anomaly <kind> | logout | quit";

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => serde_json::from_str(&tokio::fs::read_to_string(path).await?)?,
        None => LifecycleConfig::default(),
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let events: Arc<dyn SecurityEventSink> = match opts.audit_url {
        Some(audit_url) => Arc::new(
            FanoutSink::new()
                .with_sink(TracingSink)
                .with_sink(RemoteSink::spawn(
                    client.clone(),
                    RemoteSinkConfig::new(audit_url),
                )),
        ),
        None => Arc::new(TracingSink),
    };

    let controller = SessionLifecycleController::builder(
        Arc::new(HttpTokenRenewer::new(client.clone(), opts.renew_url)),
        Arc::new(HttpCredentialExchange::new(client, opts.login_url)),
        Arc::new(FileSessionStore::new(opts.session_dir)),
    )
    .with_config(config)
    .with_event_sink(Arc::clone(&events))
    .with_client(ClientContext::new(
        concat!("session_console/", env!("CARGO_PKG_VERSION")),
        opts.origin,
    ))
    .build();

    let anomalies = AnomalyObserver::new(events);

    controller.start().await?;

    let mut status = controller.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if let SessionStatus::SignedOut { reason } = current {
                match reason.notice() {
                    Some(notice) => println!("signed out: {}", notice),
                    None => println!("signed out"),
                }
            }
        }
    });

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["login", username, password] => {
                let credentials = Credentials::new(
                    Username::new((*username).to_owned()),
                    Password::new((*password).to_owned()),
                );
                match controller.login(&credentials).await {
                    Ok(()) => println!("signed in"),
                    Err(LoginError::RateLimited { retry_after, .. }) => {
                        println!("locked out, try again in {}s", retry_after.as_secs_ceil())
                    }
                    Err(LoginError::CredentialRejected {
                        remaining_attempts, ..
                    }) => println!("rejected, {} attempts remaining", remaining_attempts),
                    Err(LoginError::Unavailable(error)) => {
                        println!("identity server unavailable: {}", error)
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            ["token"] => match controller.access_token().await {
                Ok(token) => tracing::info!(
                    token = format_args!("{:#?}", token),
                    "current access token"
                ),
                Err(AccessError::NotAuthenticated) => println!("not signed in"),
                Err(err) => println!("no token: {}", err),
            },
            ["status"] => {
                println!("status: {:?}", controller.status());
                if let Some(remaining) = controller.time_until_expiry() {
                    println!("token expires in {}s", remaining.as_secs_ceil());
                }
                if let Some(remaining) = controller.expiry_warning() {
                    println!("warning: session ends in {}s", remaining.as_secs_ceil());
                }
                if let Some(remaining) = controller.lockout_remaining() {
                    println!("login locked for {}s", remaining.as_secs_ceil());
                } else {
                    println!("{} login attempts remaining", controller.remaining_attempts());
                }
            }
            ["focus"] => {
                controller.signal(Signal::FocusGained);
            }
            ["online"] => {
                controller.signal(Signal::NetworkOnline);
            }
            ["anomaly", kind] => anomalies.report(kind, "reported from console"),
            ["logout"] => {
                if !controller.force_sign_out(SignOutReason::UserLogout).await {
                    println!("not signed in");
                }
            }
            ["quit"] | ["exit"] => break,
            [] => {}
            _ => println!("{}", HELP),
        }
    }

    controller.stop();
    Ok(())
}

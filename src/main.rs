use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use url::Url;

use vtop_session::captcha_solver::{self, ClassifierState};
use vtop_session::config::DEFAULT_BASE_URL;
use vtop_session::{ClientConfig, Credentials, VtopClient, VtopError};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Logs in to the VTOP portal and keeps the session usable", long_about = None)]
struct Args {
    #[clap(long, env = "VTOP_USERNAME")]
    username: String,

    #[clap(long, env = "VTOP_PASSWORD", hide_env_values = true)]
    password: String,

    #[clap(long, env = "VTOP_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: Url,

    #[clap(long, env = "VTOP_CAPTCHA_WEIGHTS", default_value = vtop_session::config::DEFAULT_WEIGHTS_PATH)]
    weights: PathBuf,

    #[clap(long, env = "VTOP_MAX_LOGIN_ATTEMPTS", default_value_t = 3)]
    max_login_attempts: u32,

    #[clap(long, env = "VTOP_CAPTCHA_RETRIES", default_value_t = 5)]
    captcha_retries: u32,

    #[clap(long, env = "VTOP_TIMEOUT_SECS", default_value_t = 30)]
    timeout: u64,

    /// Portal path to POST with the session once logged in; its HTML is printed.
    #[clap(long)]
    page: Option<String>,
}

async fn run(args: Args) -> Result<(), VtopError> {
    let credentials = Credentials::new(&args.username, &args.password)?;
    let config = ClientConfig {
        base_url: args.base_url,
        timeout: Duration::from_secs(args.timeout),
        max_login_attempts: args.max_login_attempts,
        captcha_retries: args.captcha_retries,
        weights_path: args.weights,
        ..ClientConfig::from_env()
    };
    info!("Target portal: {}", config.base_url);

    if let ClassifierState::Failed(reason) = captcha_solver::init_classifier(&config.weights_path)
    {
        warn!("Continuing without a captcha classifier: {}", reason);
    }

    let client = VtopClient::new(credentials, config)?;
    let session = client.ensure_session().await?;
    println!("Logged in as {}", session.registration_number);

    if let Some(path) = args.page.as_deref() {
        let page = client.post_authenticated(path, &[]).await?;
        info!("Fetched {} ({})", page.url, page.status);
        println!("{}", page.body);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

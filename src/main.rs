use anyhow::{bail, Context, Result};
use brief::conversation::ConversationEvent;
use brief::identity::{sign_in_url, FileCredentialStore, IdentityContext, MemoryCredentialStore};
use brief::integration::{BriefConfig, Orchestrator, OrchestratorParts};
use brief::speech::{ConsoleRecognizer, ConsoleSynthesizer};
use brief::transport::{HttpSessionApi, WsConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brief=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config()?;
    let identity = identity_context(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("auth-callback") => {
            let url = args
                .get(1)
                .context("usage: brief auth-callback <redirect-url>")?;
            match identity.accept_callback(url)? {
                Some(user) => println!("Signed in as {}", user.email),
                None => println!("The URL carries no sign-in data"),
            }
        }
        Some("sign-in-url") => println!("{}", sign_in_url(&config.api_base_url)),
        Some("sign-out") => {
            identity.sign_out()?;
            println!("Signed out");
        }
        Some(other) => bail!("Unknown command: {}", other),
        None => run_conversation(config, identity).await?,
    }

    Ok(())
}

fn load_config() -> Result<BriefConfig> {
    let config = match std::env::var("BRIEF_CONFIG") {
        Ok(path) => BriefConfig::load(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => BriefConfig::default(),
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn identity_context(config: &BriefConfig) -> IdentityContext {
    match config.identity_file() {
        Some(path) => IdentityContext::new(Arc::new(FileCredentialStore::new(path))),
        None => {
            warn!("No data directory found; credentials will not be kept");
            IdentityContext::new(Arc::new(MemoryCredentialStore::new()))
        }
    }
}

async fn run_conversation(config: BriefConfig, identity: IdentityContext) -> Result<()> {
    let Some(user) = identity.current_user() else {
        println!(
            "Not signed in. Open {} and pass the redirect URL to `brief auth-callback`.",
            sign_in_url(&config.api_base_url)
        );
        return Ok(());
    };
    info!("Starting Brief for {}", user.email);

    let recognizer = Arc::new(ConsoleRecognizer::new());
    let parts = OrchestratorParts {
        identity,
        session_api: Arc::new(HttpSessionApi::new(config.api_base_url.clone())?),
        connector: Arc::new(WsConnector::new()),
        recognizer: recognizer.clone(),
        synthesizer: Arc::new(ConsoleSynthesizer::default()),
        on_end: Some(Arc::new(|| println!("Briefing finished. Type /start for another one."))),
    };

    let (orchestrator, handle) = Orchestrator::new(config, parts)?;
    let task = orchestrator.start();

    let events = handle.clone();
    let printer = std::thread::spawn(move || loop {
        match events.recv_event_timeout(Duration::from_millis(250)) {
            Some(ConversationEvent::Shutdown) => break,
            Some(event) => print_event(&event),
            None => {}
        }
    });

    println!("Type to answer. Commands: /pause /resume /end /start /quit");
    handle.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/pause" => handle.pause()?,
            "/resume" => handle.resume()?,
            "/end" => handle.end()?,
            "/start" => handle.start()?,
            "/quit" => break,
            text => {
                if !recognizer.feed(text) {
                    println!("(not listening; currently {})", handle.state().state);
                }
            }
        }
    }

    handle.shutdown()?;
    task.await?;
    let _ = printer.join();
    Ok(())
}

fn print_event(event: &ConversationEvent) {
    match event {
        ConversationEvent::StateChanged { to, .. } => println!("[{}]", to),
        ConversationEvent::PauseChanged(true) => println!("[paused]"),
        ConversationEvent::PauseChanged(false) => println!("[resumed]"),
        ConversationEvent::UserTurn(turn) => println!("you: {}", turn.content),
        ConversationEvent::Warning(message) => println!("! {}", message),
        ConversationEvent::Error(error) => println!("error: {}", error.user_message()),
        _ => {}
    }
}

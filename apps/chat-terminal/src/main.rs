mod config;
mod logging;
mod state;

use std::{
    error::Error,
    io::{self, Write},
    process::ExitCode,
};

use chat_core::Session;
use chat_platform::{CredentialStore, SessionGate, SessionVault};
use chat_remote::{
    AuthClient, ChatSession, ChatSessionHandle, HttpHistoryLoader, RemoteConfig, WsTransport,
    http_client,
};
use config::TerminalConfig;
use state::{TerminalLine, TerminalState};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::broadcast::error::RecvError,
};
use tracing::{error, info, warn};

type Input = Lines<BufReader<Stdin>>;

enum ChatExit {
    Quit,
    LoggedOut,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting chat-terminal");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "chat-terminal failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = TerminalConfig::from_env()?;
    info!(backend = %config.backend_url, "loaded terminal config");

    let remote = RemoteConfig::new(config.backend_url.clone())?;
    let http = http_client()?;
    let auth = AuthClient::new(http.clone(), remote.clone());
    let vault = SessionVault::new(credential_store(&config));
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut prefill = config.prefill_user.clone().zip(config.prefill_password.clone());

    loop {
        if let Err(err) = vault.check() {
            info!(reason = ?err.reason, "no usable stored session");
            let Some(session) = sign_in(&auth, &mut prefill, &mut input).await? else {
                return Ok(());
            };
            vault.save(&session)?;
        }

        let handle = ChatSession::start(
            &vault,
            HttpHistoryLoader::new(http.clone(), remote.clone(), config.tuning.history_page_size()),
            WsTransport::new(remote.clone(), &config.tuning),
            config.tuning.clone(),
        )?;

        match chat(handle, &vault, &mut input).await? {
            ChatExit::Quit => return Ok(()),
            ChatExit::LoggedOut => continue,
        }
    }
}

#[cfg(feature = "os-keyring")]
fn credential_store(_config: &TerminalConfig) -> chat_platform::OsKeyringCredentialStore {
    chat_platform::OsKeyringCredentialStore
}

#[cfg(not(feature = "os-keyring"))]
fn credential_store(config: &TerminalConfig) -> chat_platform::FileCredentialStore {
    chat_platform::FileCredentialStore::new(config.session_file.clone())
}

/// Prompt for credentials until a login or registration succeeds. Returns
/// `None` when the user quits or stdin ends.
async fn sign_in(
    auth: &AuthClient,
    prefill: &mut Option<(String, String)>,
    input: &mut Input,
) -> Result<Option<Session>, Box<dyn Error>> {
    if let Some((identifier, password)) = prefill.take() {
        match auth.login(&identifier, &password).await {
            Ok(session) => return Ok(Some(session)),
            Err(err) => {
                warn!(code = %err.code, "prefilled login failed");
                println!("{}", TerminalLine::Error(format!("sign-in failed: {}", err.message)));
            }
        }
    }

    loop {
        println!("Sign in (/register to create an account, /quit to exit)");
        let Some(identifier) = prompt(input, "username or email: ").await? else {
            return Ok(None);
        };

        let result = match identifier.as_str() {
            "" => continue,
            "/quit" => return Ok(None),
            "/register" => {
                let Some(username) = prompt(input, "username: ").await? else {
                    return Ok(None);
                };
                let Some(email) = prompt(input, "email: ").await? else {
                    return Ok(None);
                };
                let Some(password) = prompt(input, "password: ").await? else {
                    return Ok(None);
                };
                if username.is_empty() || email.is_empty() || password.is_empty() {
                    println!("{}", TerminalLine::Error("all fields are required".into()));
                    continue;
                }
                auth.register(&username, &email, &password).await
            }
            identifier => {
                let Some(password) = prompt(input, "password: ").await? else {
                    return Ok(None);
                };
                auth.login(identifier, &password).await
            }
        };

        match result {
            Ok(session) => return Ok(Some(session)),
            Err(err) => {
                warn!(code = %err.code, category = ?err.category, "sign-in failed");
                println!("{}", TerminalLine::Error(err.message));
            }
        }
    }
}

// Input is echoed; the terminal is not switched to raw mode.
async fn prompt(input: &mut Input, label: &str) -> io::Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    Ok(input.next_line().await?.map(|line| line.trim().to_owned()))
}

async fn chat<S: CredentialStore>(
    handle: ChatSessionHandle,
    vault: &SessionVault<S>,
    input: &mut Input,
) -> Result<ChatExit, Box<dyn Error>> {
    let mut events = handle.subscribe();
    let mut state = TerminalState::new(handle.user().id.clone());
    println!(
        "signed in as {} (/status, /reconnect, /logout, /quit)",
        handle.user().username
    );
    resync(&mut state, &handle);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_lines(state.handle_event(event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged, resyncing from snapshot");
                    resync(&mut state, &handle);
                }
                Err(RecvError::Closed) => {
                    warn!("session event stream closed");
                    handle.close().await;
                    return Ok(ChatExit::Quit);
                }
            },
            line = input.next_line() => {
                let Some(line) = line? else {
                    handle.close().await;
                    return Ok(ChatExit::Quit);
                };
                match line.trim() {
                    "" => {}
                    "/status" => print_status(&state),
                    "/quit" => {
                        handle.close().await;
                        return Ok(ChatExit::Quit);
                    }
                    "/logout" => {
                        handle.logout(vault).await?;
                        println!("{}", TerminalLine::Notice("logged out".into()));
                        return Ok(ChatExit::LoggedOut);
                    }
                    "/reconnect" => handle.reconnect().await?,
                    text => {
                        if !state.snapshot().can_send {
                            let notice = "offline, message will be sent after reconnecting";
                            println!("{}", TerminalLine::Notice(notice.into()));
                        }
                        handle.send_text(text).await?;
                    }
                }
            }
        }
    }
}

fn resync(state: &mut TerminalState, handle: &ChatSessionHandle) {
    print_lines(state.set_connection(handle.connection_state()));
    print_lines(state.replace_timeline(&handle.timeline()));
}

fn print_status(state: &TerminalState) {
    let snapshot = state.snapshot();
    println!(
        "{}",
        TerminalLine::Status(format!(
            "{}, {} messages",
            snapshot.status_text,
            snapshot.messages.len()
        ))
    );
    if let Some(error) = snapshot.error_text {
        println!("{}", TerminalLine::Error(error));
    }
}

fn print_lines(lines: Vec<TerminalLine>) {
    for line in lines {
        println!("{line}");
    }
}

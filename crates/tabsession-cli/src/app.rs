//! Interactive prompt for one tab.

use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tabsession_core::{
    ApiRequest, AuthClient, Config, EndReason, OwnershipState, SessionError, TabSession,
    WindowSignal,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

const HELP: &str = "\
Commands:
  login [username]            log in and take the session for this tab
  logout                      end the session
  status                      show this tab's session state
  whoami                      fetch the current account
  get <path>                  authenticated GET against the API
  register <username> [email] create an account
  help                        show this help
  quit                        close this tab";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(Option<String>),
    Logout,
    Status,
    Whoami,
    Get(String),
    Register {
        username: String,
        email: Option<String>,
    },
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    /// Parse one prompt line. Blank lines are `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let name = words.next()?;
        let arg = words.next().map(str::to_string);

        Some(match name.to_lowercase().as_str() {
            "login" => Command::Login(arg),
            "logout" => Command::Logout,
            "status" => Command::Status,
            "whoami" | "me" => Command::Whoami,
            "get" => match arg {
                Some(path) => Command::Get(path),
                None => Command::Unknown("get needs a path".to_string()),
            },
            "register" => match arg {
                Some(username) => Command::Register {
                    username,
                    email: words.next().map(str::to_string),
                },
                None => Command::Unknown("register needs a username".to_string()),
            },
            "help" | "?" => Command::Help,
            "quit" | "exit" | "close" => Command::Quit,
            other => Command::Unknown(format!("unknown command '{}'", other)),
        })
    }
}

pub struct App {
    config: Config,
    client: AuthClient,
    session: Arc<TabSession>,
    default_username: Option<String>,
    env_password: Option<String>,
}

impl App {
    pub fn new(
        config: Config,
        client: AuthClient,
        session: Arc<TabSession>,
        default_username: Option<String>,
        env_password: Option<String>,
    ) -> Self {
        Self {
            config,
            client,
            session,
            default_username,
            env_password,
        }
    }

    /// Run the prompt on stdin until quit, end of input or a shutdown signal,
    /// then close the tab.
    pub async fn run(&mut self) -> Result<()> {
        self.run_with(BufReader::new(tokio::io::stdin()), shutdown_signal())
            .await
    }

    /// Run the prompt on `input`. The tab is closed on every way out,
    /// including input errors and `shutdown` resolving mid-command.
    pub async fn run_with<R, S>(&mut self, input: R, shutdown: S) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        println!("tabsession - tab {}", self.session.tab_id());
        self.print_status();
        println!("Type 'help' for commands.");

        let announcer = self.spawn_end_announcer();
        tokio::pin!(shutdown);
        let result = self.prompt_loop(input.lines(), shutdown).await;

        self.session.window_closing(WindowSignal::BeforeUnload);
        announcer.abort();
        result
    }

    async fn prompt_loop<R, S>(&mut self, mut lines: Lines<R>, mut shutdown: Pin<&mut S>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        loop {
            prompt()?;
            let Some(line) = next_line(&mut lines, &mut shutdown).await? else {
                return Ok(());
            };
            let Some(command) = Command::parse(&line) else { continue };
            let command = match command {
                Command::Quit => return Ok(()),
                Command::Login(None) if self.default_username.is_none() => {
                    print!("Username: ");
                    io::stdout().flush()?;
                    match next_line(&mut lines, &mut shutdown).await? {
                        Some(username) => Command::Login(Some(username.trim().to_string())),
                        None => return Ok(()),
                    }
                }
                other => other,
            };
            tokio::select! {
                _ = self.execute(command) => {}
                _ = &mut shutdown => {
                    println!();
                    return Ok(());
                }
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Login(username) => self.login(username).await,
            Command::Logout => match self.session.logout() {
                Ok(()) => {}
                Err(e) => println!("Logout failed: {}", e),
            },
            Command::Status => self.print_status(),
            Command::Whoami => match self.session.me().await {
                Ok(me) => println!("{}", pretty(&me)),
                Err(e) => println!("{}", describe(&e)),
            },
            Command::Get(path) => match self.session.send(ApiRequest::get(path)).await {
                Ok(response) => {
                    println!("HTTP {}", response.status);
                    match serde_json::from_str::<serde_json::Value>(&response.body) {
                        Ok(body) => println!("{}", pretty(&body)),
                        Err(_) => println!("{}", response.body),
                    }
                }
                Err(e) => println!("{}", describe(&e)),
            },
            Command::Register { username, email } => self.register(&username, email.as_deref()).await,
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
            Command::Unknown(msg) => println!("{} (try 'help')", msg),
        }
    }

    async fn login(&mut self, username: Option<String>) {
        let Some(username) = username.or_else(|| self.default_username.clone()) else {
            println!("Username required");
            return;
        };
        let password = match self.env_password.take() {
            Some(p) => p,
            None => match read_password().await {
                Ok(p) => p,
                Err(e) => {
                    println!("Failed to read password: {}", e);
                    return;
                }
            },
        };

        println!("Authenticating...");
        match self.session.login(&username, &password).await {
            Ok(()) => {
                info!(username = %username, "Login successful");
                println!("Logged in as {}.", username);
                self.remember_username(username);
            }
            Err(e) => {
                error!(error = %e, "Login failed");
                println!("{}", describe(&e));
            }
        }
    }

    async fn register(&self, username: &str, email: Option<&str>) {
        let password = match read_password().await {
            Ok(p) => p,
            Err(e) => {
                println!("Failed to read password: {}", e);
                return;
            }
        };
        match self.client.register(username, email, &password).await {
            Ok(_) => println!("Account created. Log in with 'login {}'.", username),
            Err(e) => println!("Registration failed: {}", e),
        }
    }

    fn remember_username(&mut self, username: String) {
        self.default_username = Some(username.clone());
        self.config.last_username = Some(username);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }

    fn print_status(&self) {
        let state = match self.session.view() {
            Ok(state) => state,
            Err(e) => {
                println!("Failed to read session state: {}", e);
                return;
            }
        };
        let text = match state {
            OwnershipState::OwnedBySelf => "logged in (this tab owns the session)",
            OwnershipState::OwnedByOther => "logged out (another tab owns the session)",
            OwnershipState::LoggedOut => "logged out",
            OwnershipState::Unclaimed => "starting",
        };
        println!("Session: {}", text);
    }

    /// Print a line whenever the session ends for a reason other than this
    /// tab's own logout command.
    fn spawn_end_announcer(&self) -> tokio::task::JoinHandle<()> {
        let mut ended = self.session.session_ended();
        tokio::spawn(async move {
            loop {
                match ended.recv().await {
                    Ok(event) => {
                        let text = match event.reason {
                            EndReason::UserLogout => "Logged out.",
                            EndReason::WindowClosing => continue,
                            EndReason::OwnershipConflict => {
                                "Session taken over by another tab - please log in again."
                            }
                            EndReason::RemoteLogout => {
                                "Session ended in another tab - please log in again."
                            }
                            EndReason::RefreshRejected => "Session expired - please log in again.",
                        };
                        println!("\n{}", text);
                        let _ = prompt();
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// The next input line, or `None` at end of input or on shutdown.
async fn next_line<R, S>(lines: &mut Lines<R>, shutdown: &mut Pin<&mut S>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?),
        _ = shutdown => {
            println!();
            Ok(None)
        }
    }
}

/// Resolves on Ctrl-C, and on Unix also on SIGTERM or SIGHUP.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut terminate), Ok(mut hangup)) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => info!("Received SIGTERM"),
                    _ = hangup.recv() => info!("Received SIGHUP"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers, only Ctrl-C closes the tab");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn prompt() -> io::Result<()> {
    print!("> ");
    io::stdout().flush()
}

async fn read_password() -> Result<String> {
    let password = tokio::task::spawn_blocking(|| rpassword::prompt_password("Password: ")).await??;
    Ok(password)
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// User-facing text for a session error.
fn describe(e: &SessionError) -> String {
    match e {
        SessionError::InvalidCredentials => "Invalid username or password".to_string(),
        SessionError::NetworkFailure(_) => {
            "Unable to connect to server. Check your connection and try again.".to_string()
        }
        SessionError::SessionEnded => "Session ended - please log in again.".to_string(),
        other => format!("Request failed: {}", other),
    }
}

//! Console application state and main loop.
//!
//! Every line typed counts as keyboard activity for the idle timer. Once the
//! session ends, commands that need it are refused until the user signs in
//! again.

use std::io::{self, Write};

use anyhow::Result;
use bizdesk_core::{ActivityKind, ApiClient, ApiError, Config, Method};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};

use crate::command::{render, Command, HELP};

// ============================================================================
// Constants
// ============================================================================

/// Maximum length for username input.
const MAX_USERNAME_LENGTH: usize = 100;

/// Maximum login attempts before giving up on a login prompt.
const MAX_LOGIN_ATTEMPTS: usize = 3;

pub struct App {
    config: Config,
    client: ApiClient,
    input: Lines<BufReader<Stdin>>,
}

impl App {
    pub fn new(config: Config, client: ApiClient) -> Self {
        Self {
            config,
            client,
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        println!("bizdesk - type 'help' for commands.");

        if !self.client.lifecycle().is_authenticated() && !self.login_prompt().await? {
            return Ok(());
        }

        loop {
            let Some(line) = self.read_line("bizdesk> ").await? else {
                return Ok(());
            };
            self.client.lifecycle().record_activity(ActivityKind::KeyDown);

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(message) => {
                    println!("{}", message);
                    continue;
                }
            };

            match command {
                Command::Quit => return Ok(()),
                Command::Login if self.client.lifecycle().is_authenticated() => {
                    println!("Already signed in. Use 'logout' first.");
                }
                Command::Login => {
                    if !self.login_prompt().await? {
                        return Ok(());
                    }
                }
                // The session may have ended while waiting for input
                ref c if c.needs_session() && !self.client.lifecycle().is_authenticated() => {
                    println!("Not signed in. Type 'login' to start a session.");
                }
                command => self.execute(command).await,
            }
        }
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Prompt for credentials until signed in. Returns false on end of input.
    async fn login_prompt(&mut self) -> Result<bool> {
        println!("\n=== bizdesk login ===");

        for _ in 0..MAX_LOGIN_ATTEMPTS {
            let username = match self.prompt_username().await? {
                Some(username) => username,
                None => return Ok(false),
            };
            if username.eq_ignore_ascii_case("quit") {
                return Ok(false);
            }

            let password = tokio::task::spawn_blocking(|| rpassword::prompt_password("Password: "))
                .await??;

            match self.client.login(&username, &password).await {
                Ok(_) => {
                    info!("Login successful");
                    println!("Signed in as {}.", username);
                    self.config.last_username = Some(username);
                    if let Err(e) = self.config.save() {
                        warn!(error = %e, "Failed to save config");
                    }
                    return Ok(true);
                }
                Err(e) => {
                    error!(error = %e, "Login failed");
                    println!("{}", Self::login_error_message(&e));
                }
            }
        }

        println!("Too many failed attempts.");
        Ok(false)
    }

    async fn prompt_username(&mut self) -> Result<Option<String>> {
        let prompt = match self.config.last_username {
            Some(ref last) => format!("Username [{}]: ", last),
            None => "Username: ".to_string(),
        };
        let Some(input) = self.read_line(&prompt).await? else {
            return Ok(None);
        };

        let input: String = input.trim().chars().take(MAX_USERNAME_LENGTH).collect();
        if input.is_empty() {
            if let Some(ref last) = self.config.last_username {
                return Ok(Some(last.clone()));
            }
        }
        Ok(Some(input))
    }

    /// User-facing text for a failed login.
    fn login_error_message(err: &ApiError) -> String {
        match err {
            ApiError::Request { status, .. } if status.as_u16() == 401 => {
                "Invalid username or password".to_string()
            }
            ApiError::Network(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            ApiError::Network(_) => {
                "Unable to connect to server. Check your connection.".to_string()
            }
            other => format!("Login failed: {}", other),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn execute(&self, command: Command) {
        let client = &self.client;
        let result = match command {
            Command::Empty | Command::Quit | Command::Login => return,
            Command::Help => {
                println!("{}", HELP);
                return;
            }
            Command::Status => {
                self.print_status();
                return;
            }
            Command::Logout => {
                client.logout().await;
                println!("Signed out.");
                return;
            }
            Command::Register(body) => match client.register(&body).await {
                Ok(Some(_)) => {
                    println!("Registered and signed in.");
                    return;
                }
                Ok(None) => {
                    println!("Registered.");
                    return;
                }
                Err(e) => Err(e),
            },
            Command::Get(path) => client.send(Method::GET, &path, None).await,
            Command::Delete(path) => client.send(Method::DELETE, &path, None).await,
            Command::Post(path, body) => client.send(Method::POST, &path, Some(body)).await,
            Command::Put(path, body) => client.send(Method::PUT, &path, Some(body)).await,
            Command::Patch(path, body) => client.send(Method::PATCH, &path, Some(body)).await,
        };

        match result {
            Ok(payload) => println!("{}", render(payload)),
            // Already signed out by the client
            Err(e) if e.is_session_expired() => println!("{}", e),
            Err(e) => println!("Error: {}", e),
        }
    }

    fn print_status(&self) {
        let lifecycle = self.client.lifecycle();
        let status = lifecycle.status();
        if !status.authenticated {
            println!("Not signed in.");
            return;
        }

        println!("Signed in (session {}).", status.epoch);
        if let Some(remaining) = lifecycle.idle().remaining() {
            println!(
                "Idle logout in {}m {:02}s{}.",
                remaining.as_secs() / 60,
                remaining.as_secs() % 60,
                if lifecycle.idle().in_warning() { " (warning shown)" } else { "" }
            );
        }
    }

    async fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        print!("{}", prompt);
        io::stdout().flush()?;
        Ok(self.input.next_line().await?)
    }
}

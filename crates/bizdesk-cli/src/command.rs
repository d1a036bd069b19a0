use bizdesk_core::Payload;
use serde_json::Value;

/// One line of console input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Login,
    Logout,
    Register(Value),
    Get(String),
    Delete(String),
    Post(String, Value),
    Put(String, Value),
    Patch(String, Value),
    Status,
    Help,
    Quit,
    Empty,
}

pub const HELP: &str = "\
Commands:
  get <path>                 GET a resource, e.g. get /products
  delete <path>              DELETE a resource
  post <path> <json>         POST a JSON body
  put <path> <json>          PUT a JSON body
  patch <path> <json>        PATCH a JSON body
  register <json>            create an account
  login | logout             start or end the session
  status                     show session and idle-timer state
  help                       show this text
  quit                       exit";

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Command::Empty);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_lowercase().as_str() {
            "login" => Ok(Command::Login),
            "logout" => Ok(Command::Logout),
            "status" => Ok(Command::Status),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            "register" => Ok(Command::Register(parse_json(rest)?)),
            "get" => Ok(Command::Get(require_path(rest)?.to_string())),
            "delete" => Ok(Command::Delete(require_path(rest)?.to_string())),
            "post" | "put" | "patch" => {
                let (path, body) = match rest.split_once(char::is_whitespace) {
                    Some((path, body)) => (path, parse_json(body)?),
                    None => return Err(format!("usage: {} <path> <json>", verb)),
                };
                let path = path.to_string();
                Ok(match verb.to_ascii_lowercase().as_str() {
                    "post" => Command::Post(path, body),
                    "put" => Command::Put(path, body),
                    _ => Command::Patch(path, body),
                })
            }
            other => Err(format!("unknown command '{}' (try 'help')", other)),
        }
    }

    /// Commands that only make sense with a signed-in session.
    pub fn needs_session(&self) -> bool {
        matches!(
            self,
            Command::Get(_)
                | Command::Delete(_)
                | Command::Post(..)
                | Command::Put(..)
                | Command::Patch(..)
                | Command::Logout
        )
    }
}

fn require_path(rest: &str) -> Result<&str, String> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        Err("expected a single path, e.g. /products".to_string())
    } else {
        Ok(rest)
    }
}

fn parse_json(text: &str) -> Result<Value, String> {
    serde_json::from_str(text.trim()).map_err(|e| format!("invalid JSON body: {}", e))
}

/// Render a response body for the console.
pub fn render(payload: Payload) -> String {
    match payload {
        Payload::Empty => "(no content)".to_string(),
        Payload::Json(value) => {
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
        }
    }
}

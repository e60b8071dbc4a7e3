//! Session plumbing for interactive front ends.
//!
//! A [`Session`] owns one frame (a child of the built-in frame) and turns free
//! form request text into response text: it recognizes the exit command, strips
//! echoed prompt markers, evaluates the input and renders either the value or
//! the error class. Transport is left to the caller; [`Session::handle_json`]
//! covers the common `{"input": ...}` / `{"output": ...}` exchange.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Error;
use crate::ast::Value;
use crate::evaluator::{Frame, evaluate_with_frame};
use crate::scheme::{parse, tokenize};

/// Configuration for a [`Session`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Input that ends the session, compared case-insensitively
    pub exit_command: String,
    /// Response sent for the exit command
    pub farewell: String,
    /// Prompt markers removed from the start of each input line
    pub prompt_markers: Vec<String>,
    /// Prefix of a successful result
    pub result_prefix: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            exit_command: "exit".into(),
            farewell: "bye bye!\n".into(),
            prompt_markers: vec!["in>".into()],
            result_prefix: "out> ".into(),
        }
    }
}

impl ShellConfig {
    /// Load a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub output: String,
}

impl Response {
    fn new(output: impl Into<String>) -> Self {
        Response {
            output: output.into(),
        }
    }
}

/// One interactive session with its own persistent frame
pub struct Session {
    config: ShellConfig,
    frame: Rc<Frame>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(ShellConfig::default())
    }
}

impl Session {
    pub fn new(config: ShellConfig) -> Self {
        debug!(exit_command = %config.exit_command, "created session frame");
        Session {
            config,
            frame: Frame::session(),
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn frame(&self) -> &Rc<Frame> {
        &self.frame
    }

    fn strip_prompts(&self, input: &str) -> String {
        input
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                self.config
                    .prompt_markers
                    .iter()
                    .find_map(|marker| trimmed.strip_prefix(marker.as_str()))
                    .unwrap_or(line)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn evaluate(&mut self, text: &str) -> Result<Value, Error> {
        let expr = parse(&tokenize(text))?;
        let (value, frame) = evaluate_with_frame(&expr, Some(Rc::clone(&self.frame)))?;
        self.frame = frame;
        Ok(value)
    }

    /// Evaluate one request and render the response text.
    pub fn respond(&mut self, input: &str) -> Response {
        let input = input.trim();
        if input.eq_ignore_ascii_case(&self.config.exit_command) {
            return Response::new(self.config.farewell.clone());
        }

        let text = self.strip_prompts(input);
        match panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(&text))) {
            Ok(Ok(value)) => Response::new(format!("{}{value}\n", self.config.result_prefix)),
            Ok(Err(err)) => Response::new(format!("{}: {err}\n", err.kind())),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|msg| (*msg).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown failure".to_owned());
                warn!(%message, "evaluation panicked");
                Response::new(format!("Error: {message}\n"))
            }
        }
    }

    /// Decode a `{"input": ...}` body, respond, and encode `{"output": ...}`.
    pub fn handle_json(&mut self, body: &str) -> String {
        let response = match serde_json::from_str::<Request>(body) {
            Ok(request) => self.respond(&request.input),
            Err(err) => Response::new(format!("Error processing request: {err}\n")),
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|err| format!("{{\"output\":\"Error processing request: {err}\\n\"}}"))
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(session: &mut Session, inputs: &[&str]) -> Vec<String> {
        inputs
            .iter()
            .map(|input| session.respond(input).output)
            .collect()
    }

    #[test]
    fn test_session_keeps_state_between_requests() {
        let mut session = Session::default();
        assert_eq!(
            outputs(
                &mut session,
                &[
                    "(define x 5)",
                    "(* x 2)",
                    "  (list x 1.5)  ",
                    "in> (+ x 1)",
                    "(lambda (a) a)",
                    "car",
                ]
            ),
            vec![
                "out> 5\n",
                "out> 10\n",
                "out> (5 1.5)\n",
                "out> 6\n",
                "out> #<procedure (a)>\n",
                "out> #<builtin car>\n",
            ]
        );
    }

    #[test]
    fn test_errors_render_with_their_class() {
        let mut session = Session::default();
        assert_eq!(
            outputs(&mut session, &["undefined", "(car ())", "(+ 1", "1 2", ""]),
            vec![
                "SchemeNameError: Unbound variable: undefined\n",
                "SchemeEvaluationError: Type error: 'car' requires a pair, got empty list ()\n",
                "SchemeSyntaxError: ParseError: missing closing parenthesis\n",
                "SchemeSyntaxError: ParseError: unexpected tokens after a complete expression (found '2')\n",
                "SchemeSyntaxError: ParseError: no expression to parse\n",
            ]
        );
        // The session is still usable
        assert_eq!(session.respond("(+ 1 2)").output, "out> 3\n");
    }

    #[test]
    fn test_deeply_nested_results_render() {
        let mut session = Session::default();
        let nested = format!("{}{}", "(".repeat(100_000), ")".repeat(100_000));
        let output = session.respond(&format!("(quote {nested})")).output;
        assert_eq!(output, format!("out> {nested}\n"));
        assert_eq!(session.respond("(+ 1 2)").output, "out> 3\n");
    }

    #[test]
    fn test_exit_command() {
        let mut session = Session::default();
        assert_eq!(session.respond("  EXIT ").output, "bye bye!\n");

        let config = ShellConfig::from_json(r#"{"exit_command": "quit", "farewell": "ciao\n"}"#)
            .unwrap();
        assert_eq!(config.result_prefix, "out> ");
        let mut session = Session::new(config);
        assert_eq!(session.respond("quit").output, "ciao\n");
        assert_eq!(
            session.respond("exit").output,
            "SchemeNameError: Unbound variable: exit\n"
        );
    }

    #[test]
    fn test_sessions_are_isolated() {
        let mut first = Session::default();
        let mut second = Session::default();
        first.respond("(define shared 1)");
        assert_eq!(
            second.respond("shared").output,
            "SchemeNameError: Unbound variable: shared\n"
        );
    }

    #[test]
    fn test_handle_json() {
        let mut session = Session::default();
        let reply: serde_json::Value =
            serde_json::from_str(&session.handle_json(r#"{"input": "(+ 2 3)"}"#)).unwrap();
        assert_eq!(reply, json!({"output": "out> 5\n"}));

        let reply: serde_json::Value =
            serde_json::from_str(&session.handle_json("not json")).unwrap();
        let output = reply["output"].as_str().unwrap();
        assert!(output.starts_with("Error processing request: "));
        assert!(output.ends_with('\n'));
    }
}

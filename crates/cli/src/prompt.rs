//! Interactive replay decisions.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use herald_core::{BrokerError, BrokerResult};
use herald_transport::{DeadLetter, ReplayDecision};
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::ser::{PrettyFormatter, Serializer};
use tracing::{debug, warn};

/// Asks the operator what to do with each dead letter.
///
/// Lines are read on a background thread so an unanswered prompt can time
/// out; a timeout leaves the message in place. Lines typed after a prompt
/// timed out are dropped, never applied to the next message.
pub struct Prompt {
    answers: Receiver<String>,
    timeout: Duration,
    timed_out: bool,
}

impl Prompt {
    pub fn stdin(timeout: Duration) -> Self {
        Self::new(io::BufReader::new(io::stdin()), timeout)
    }

    pub fn new<R>(input: R, timeout: Duration) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, answers) = mpsc::channel();
        thread::spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            answers,
            timeout,
            timed_out: false,
        }
    }

    pub fn ask(&mut self, letter: &DeadLetter) -> BrokerResult<ReplayDecision> {
        if std::mem::take(&mut self.timed_out) {
            let stale = self.answers.try_iter().count();
            if stale > 0 {
                debug!(stale, "dropping answers typed after the previous prompt timed out");
            }
        }

        println!("Please specify action for:");
        println!("{}", render_body(&letter.body));
        print!("(R)eplay, (D)iscard or (L)eave? ");
        let _ = io::stdout().flush();

        let answer = match self.answers.recv_timeout(self.timeout) {
            Ok(answer) => answer,
            Err(RecvTimeoutError::Timeout) => {
                println!();
                self.timed_out = true;
                warn!(queue = %letter.queue, "no answer in time; leaving event in place");
                return Ok(ReplayDecision::Leave);
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(BrokerError::invalid_decision("input closed"));
            }
        };
        decision_from_answer(&answer)
    }
}

/// Only the first character of the answer counts.
fn decision_from_answer(answer: &str) -> BrokerResult<ReplayDecision> {
    let first = answer.trim().chars().next().map(String::from).unwrap_or_default();
    first.parse()
}

/// Body as indented JSON with sorted keys, or as text if it is not JSON.
fn render_body(body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        return String::from_utf8_lossy(body).into_owned();
    };
    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    match value.serialize(&mut serializer) {
        Ok(()) => String::from_utf8_lossy(&out).into_owned(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use herald_transport::broker::MessageProperties;

    use super::*;

    fn letter() -> DeadLetter {
        DeadLetter {
            queue: "billing".into(),
            delivery_tag: 1,
            routing_key: "order.placed".into(),
            properties: MessageProperties::persistent_json(),
            body: br#"{"b": 1, "a": {"c": true}}"#.to_vec(),
            remaining: 0,
        }
    }

    #[test]
    fn first_character_decides() {
        assert_eq!(decision_from_answer("replay").unwrap(), ReplayDecision::Retry);
        assert_eq!(decision_from_answer("d").unwrap(), ReplayDecision::Discard);
        assert_eq!(decision_from_answer(" Leave it").unwrap(), ReplayDecision::Leave);
        assert!(decision_from_answer("").is_err());
        assert!(decision_from_answer("x").is_err());
    }

    #[test]
    fn body_is_rendered_sorted_and_indented() {
        let rendered = render_body(&letter().body);
        assert_eq!(
            rendered,
            "{\n    \"a\": {\n        \"c\": true\n    },\n    \"b\": 1\n}"
        );
        assert_eq!(render_body(b"not json"), "not json");
    }

    #[test]
    fn answers_are_read_in_order() {
        let input = Cursor::new(b"r\nd\n".to_vec());
        let mut prompt = Prompt::new(input, Duration::from_secs(5));
        assert_eq!(prompt.ask(&letter()).unwrap(), ReplayDecision::Retry);
        assert_eq!(prompt.ask(&letter()).unwrap(), ReplayDecision::Discard);
        assert!(prompt.ask(&letter()).is_err());
    }

    #[test]
    fn silence_leaves_the_event() {
        let (_keep_open, rx) = mpsc::channel::<String>();
        let mut prompt = Prompt {
            answers: rx,
            timeout: Duration::from_millis(20),
            timed_out: false,
        };
        assert_eq!(prompt.ask(&letter()).unwrap(), ReplayDecision::Leave);
    }

    #[test]
    fn late_answer_does_not_decide_the_next_event() {
        let (tx, rx) = mpsc::channel::<String>();
        let mut prompt = Prompt {
            answers: rx,
            timeout: Duration::from_millis(50),
            timed_out: false,
        };
        let typist = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            tx.send("d".into()).unwrap();
            tx
        });

        assert_eq!(prompt.ask(&letter()).unwrap(), ReplayDecision::Leave);
        let _keep_open = typist.join().unwrap();
        assert_eq!(prompt.ask(&letter()).unwrap(), ReplayDecision::Leave);
    }
}

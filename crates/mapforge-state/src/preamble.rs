//! Client preamble scripts and their hot-reloadable service.
//!
//! An init file scripts what the server says to a client at three
//! points of its session:
//!
//! ```text
//! // sent on connect, before the OK greeting
//! AV {"Grid": "A0", "XView": 0, "YView": 0}
//! AUTH
//! // sent right after GRANTED
//! DSM {
//!     "Condition": "prone", "Shape": "|v", "Color": "black"
//! }
//! READY
//! // sent after READY
//! SYNC
//! ```
//!
//! `AUTH` and `READY` lines switch the bucket that following records go
//! to; `SYNC` asks for a full state sync after `READY`. A record is a
//! message tag followed by a JSON object, on one line or continued until
//! a line that starts with `}`. Records are checked against the message
//! table and stored re-encoded, ready to send.

use std::path::PathBuf;
use std::sync::Arc;

use mapforge_protocol::{Codec, LineCodec, Message};
use tokio::sync::{mpsc, oneshot, watch};

use crate::StateError;

const NAME: &str = "preamble service";

/// The parsed init file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreambleData {
    /// Lines sent on connect.
    pub preamble: Vec<String>,
    /// Lines sent after successful authentication.
    pub post_auth: Vec<String>,
    /// Lines sent after `READY`.
    pub post_ready: Vec<String>,
    /// Whether a full SYNC follows the post-ready lines.
    pub sync_data: bool,
}

impl PreambleData {
    /// Parses init-file text.
    ///
    /// # Errors
    /// [`StateError::Record`] for an unknown tag or bad payload,
    /// [`StateError::Parse`] for structural problems. Line numbers are
    /// 1-based and point at the record's first line.
    pub fn parse(text: &str) -> Result<Self, StateError> {
        let mut data = Self::default();
        let mut bucket = Bucket::Preamble;
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

        while let Some((line_no, raw)) = lines.next() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("//") {
                // Comments go out exactly as written, minus the line ending.
                data.bucket(bucket).push(raw.trim_end().to_owned());
                continue;
            }
            match line {
                "AUTH" => {
                    bucket = Bucket::PostAuth;
                    continue;
                }
                "READY" => {
                    bucket = Bucket::PostReady;
                    continue;
                }
                "SYNC" => {
                    data.sync_data = true;
                    continue;
                }
                _ => {}
            }

            let (tag, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();
            let json = if rest.is_empty() || rest.ends_with('}') {
                rest.to_owned()
            } else if rest.starts_with('{') {
                continued_object(rest, &mut lines).ok_or_else(|| StateError::Parse {
                    line: line_no,
                    reason: format!("{tag} record has no closing line starting with '}}'"),
                })?
            } else {
                return Err(StateError::Parse {
                    line: line_no,
                    reason: format!("expected a JSON object after {tag}"),
                });
            };

            let msg = Message::from_parts(tag, &json)
                .map_err(|source| StateError::Record { line: line_no, source })?;
            let encoded = LineCodec
                .encode(&msg)
                .map_err(|source| StateError::Record { line: line_no, source })?;
            data.bucket(bucket).push(encoded);
        }

        Ok(data)
    }

    fn bucket(&mut self, bucket: Bucket) -> &mut Vec<String> {
        match bucket {
            Bucket::Preamble => &mut self.preamble,
            Bucket::PostAuth => &mut self.post_auth,
            Bucket::PostReady => &mut self.post_ready,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Bucket {
    Preamble,
    PostAuth,
    PostReady,
}

/// Joins `first` with following lines up to and including the first
/// line that starts with `}`. `None` if the text ends first.
///
/// Only a `}` in the first column closes the record. Nested objects are
/// indented, so a `}` after leading whitespace belongs to the inner value
/// and the record keeps going.
fn continued_object<'a>(
    first: &str,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Option<String> {
    let mut json = first.to_owned();
    for (_, line) in lines {
        json.push('\n');
        json.push_str(line);
        if line.starts_with('}') {
            return Some(json);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// PreambleService
// ---------------------------------------------------------------------------

enum PreambleCommand {
    Reload {
        reply: oneshot::Sender<Result<(), StateError>>,
    },
}

/// Handle to the preamble service actor. Cheap to clone.
///
/// The current [`PreambleData`] is published through a `watch` channel:
/// every reload swaps in a new, fully parsed copy, so [`fetch`](Self::fetch)
/// never waits on a reload and never sees a half-built one.
#[derive(Debug, Clone)]
pub struct PreambleService {
    sender: mpsc::Sender<PreambleCommand>,
    current: watch::Receiver<Arc<PreambleData>>,
}

impl PreambleService {
    /// Starts the service with an empty preamble. Call
    /// [`reload`](Self::reload) to read `path`.
    pub fn spawn(path: Option<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(4);
        let (current_tx, current_rx) = watch::channel(Arc::new(PreambleData::default()));
        let actor = PreambleActor {
            path,
            current: current_tx,
            receiver: rx,
        };
        tokio::spawn(actor.run());
        Self {
            sender: tx,
            current: current_rx,
        }
    }

    /// Re-reads the init file.
    ///
    /// A missing file yields an empty preamble. On error the previous
    /// copy stays in effect.
    pub async fn reload(&self) -> Result<(), StateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(PreambleCommand::Reload { reply: reply_tx })
            .await
            .map_err(|_| StateError::Unavailable(NAME))?;
        reply_rx.await.map_err(|_| StateError::Unavailable(NAME))?
    }

    /// A private copy of the current preamble.
    pub fn fetch(&self) -> PreambleData {
        PreambleData::clone(&self.current.borrow())
    }
}

struct PreambleActor {
    path: Option<PathBuf>,
    current: watch::Sender<Arc<PreambleData>>,
    receiver: mpsc::Receiver<PreambleCommand>,
}

impl PreambleActor {
    async fn run(mut self) {
        while let Some(PreambleCommand::Reload { reply }) = self.receiver.recv().await {
            let result = self.reload().await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "init file reload failed, keeping previous preamble");
            }
            let _ = reply.send(result);
        }
    }

    async fn reload(&self) -> Result<(), StateError> {
        let Some(path) = &self.path else {
            self.current.send_replace(Arc::new(PreambleData::default()));
            return Ok(());
        };

        let data = match tokio::fs::read_to_string(path).await {
            Ok(text) => PreambleData::parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no init file, using empty preamble");
                PreambleData::default()
            }
            Err(source) => {
                return Err(StateError::ReadInitFile {
                    path: path.clone(),
                    source,
                });
            }
        };

        tracing::info!(
            path = %path.display(),
            preamble = data.preamble.len(),
            post_auth = data.post_auth.len(),
            post_ready = data.post_ready.len(),
            sync = data.sync_data,
            "init file loaded"
        );
        self.current.send_replace(Arc::new(data));
        Ok(())
    }
}

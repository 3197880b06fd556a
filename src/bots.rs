//! HTTP client for the meeting assistant bots.
//!
//! Each bot takes the latest recorded segment as a WAV upload and answers
//! with generated text.

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BotsConfig;
use crate::error::{Error, Result};
use crate::recorder::Segment;
use crate::signaling::MeetingId;

const UPLOAD_FILE_NAME: &str = "meeting_recording.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotKind {
    Summary,
    Positive,
    Negative,
    Moya,
    Loader,
}

impl BotKind {
    pub const ALL: [BotKind; 5] = [
        BotKind::Summary,
        BotKind::Positive,
        BotKind::Negative,
        BotKind::Moya,
        BotKind::Loader,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            BotKind::Summary => "summary",
            BotKind::Positive => "positive",
            BotKind::Negative => "negative",
            BotKind::Moya => "moya",
            BotKind::Loader => "loader",
        }
    }

    /// Name shown next to the bot's replies.
    pub fn label(&self) -> &'static str {
        match self {
            BotKind::Summary => "Summary",
            BotKind::Positive => "Positive Feedback",
            BotKind::Negative => "Attendance Checker",
            BotKind::Moya => "Communication",
            BotKind::Loader => "Paper Loader",
        }
    }
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for BotKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BotKind::ALL
            .into_iter()
            .find(|kind| kind.path().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Config(format!("unknown bot '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotReply {
    Text { kind: BotKind, text: String },
    Notes { text: String, note_ids: Vec<i64> },
}

impl BotReply {
    pub fn text(&self) -> &str {
        match self {
            BotReply::Text { text, .. } | BotReply::Notes { text, .. } => text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenericReply {
    llm_response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoaderReply {
    response: Option<String>,
    #[serde(default)]
    note_ids: Option<NoteIds>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NoteIds {
    One(i64),
    Many(Vec<i64>),
}

impl From<NoteIds> for Vec<i64> {
    fn from(ids: NoteIds) -> Self {
        match ids {
            NoteIds::One(id) => vec![id],
            NoteIds::Many(ids) => ids,
        }
    }
}

/// Unwraps the `{success, data}` envelope some bots use.
fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("success") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

pub fn parse_reply(kind: BotKind, body: &str) -> Result<BotReply> {
    let payload = unwrap_envelope(serde_json::from_str(body)?);
    match kind {
        BotKind::Loader => {
            let reply: LoaderReply = serde_json::from_value(payload)?;
            Ok(BotReply::Notes {
                text: reply.response.unwrap_or_else(|| "(no response)".to_string()),
                note_ids: reply.note_ids.map(Vec::from).unwrap_or_default(),
            })
        }
        kind => {
            let reply: GenericReply = serde_json::from_value(payload)?;
            Ok(BotReply::Text {
                kind,
                text: reply
                    .llm_response
                    .unwrap_or_else(|| "(no llm_response)".to_string()),
            })
        }
    }
}

pub struct BotClient {
    client: reqwest::Client,
    base_url: String,
}

impl BotClient {
    pub fn new(base_url: &str, config: &BotsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, kind: BotKind) -> String {
        format!("{}/api/v1/bot/{}", self.base_url, kind.path())
    }

    /// Uploads `segment` to the bot. Returns `None` without contacting the
    /// service when there is nothing recorded.
    pub async fn submit(
        &self,
        kind: BotKind,
        meeting_id: MeetingId,
        segment: &Segment,
        sample_rate: u32,
    ) -> Result<Option<BotReply>> {
        if segment.is_empty() {
            warn!("Recorded segment is empty; not asking the {} bot", kind);
            return Ok(None);
        }

        let wav = segment.to_wav(sample_rate)?;
        debug!("Uploading {} bytes to the {} bot", wav.len(), kind);
        let form = Form::new()
            .part(
                "file",
                Part::bytes(wav)
                    .file_name(UPLOAD_FILE_NAME)
                    .mime_str("audio/wav")?,
            )
            .text("meeting_id", meeting_id.to_string());

        let response = self
            .client
            .post(self.endpoint(kind))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Other(anyhow::anyhow!(
                "{} bot failed ({}): {}",
                kind.label(),
                status,
                body
            )));
        }

        let reply = parse_reply(kind, &body)?;
        info!("{} bot replied ({} chars)", kind.label(), reply.text().len());
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecordingFormat;

    #[test]
    fn generic_reply_in_either_envelope() {
        let wrapped = r#"{"success":true,"data":{"llm_response":"short summary"}}"#;
        let bare = r#"{"llm_response":"short summary"}"#;
        for body in [wrapped, bare] {
            assert_eq!(
                parse_reply(BotKind::Summary, body).unwrap(),
                BotReply::Text {
                    kind: BotKind::Summary,
                    text: "short summary".to_string()
                }
            );
        }
    }

    #[test]
    fn missing_llm_response_gets_placeholder() {
        let reply = parse_reply(BotKind::Moya, "{}").unwrap();
        assert_eq!(reply.text(), "(no llm_response)");
    }

    #[test]
    fn loader_accepts_one_or_many_note_ids() {
        let one = parse_reply(BotKind::Loader, r#"{"response":"saved","note_ids":7}"#).unwrap();
        assert_eq!(
            one,
            BotReply::Notes {
                text: "saved".to_string(),
                note_ids: vec![7]
            }
        );

        let many = parse_reply(
            BotKind::Loader,
            r#"{"success":true,"data":{"response":"saved","note_ids":[1,2]}}"#,
        )
        .unwrap();
        assert!(matches!(many, BotReply::Notes { note_ids, .. } if note_ids == vec![1, 2]));
    }

    #[test]
    fn kinds_parse_from_their_path() {
        assert_eq!("negative".parse::<BotKind>().unwrap(), BotKind::Negative);
        assert_eq!(" Loader ".parse::<BotKind>().unwrap(), BotKind::Loader);
        assert!("weather".parse::<BotKind>().is_err());
        assert_eq!(BotKind::Negative.label(), "Attendance Checker");
    }

    #[tokio::test]
    async fn empty_segment_is_not_uploaded() {
        // Nothing listens here; an attempted request would fail.
        let client = BotClient::new("http://127.0.0.1:9", &BotsConfig::default()).unwrap();
        let reply = client
            .submit(BotKind::Summary, 1, &Segment::empty(RecordingFormat::Pcm16), 48_000)
            .await
            .unwrap();
        assert_eq!(reply, None);
        assert_eq!(
            client.endpoint(BotKind::Summary),
            "http://127.0.0.1:9/api/v1/bot/summary"
        );
    }
}

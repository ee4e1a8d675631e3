// src/core/bus/envelope.rs

//! The flat `key=value&...` wire format of shared-object messages.
//!
//! Every message body carries a command tag, the subject id and its kind.
//! Updates and broadcast replies add a `pairs` tag encoding key/value/change-id
//! triples with `|`, `~` and `%` as field delimiters; deletions add a `keys`
//! tag. Values containing any delimiter byte are rejected at emission time,
//! the protocol has no escaping.

use crate::core::CoreError;
use std::fmt;

pub const TAG_CMD: &str = "mqsh.cmd";
pub const TAG_SUBJECT: &str = "mqsh.subject";
pub const TAG_PAIRS: &str = "mqsh.pairs";
pub const TAG_KEYS: &str = "mqsh.keys";
pub const TAG_REPLY: &str = "mqsh.reply";
pub const TAG_TYPE: &str = "mqsh.type";

/// Bytes that may not appear in broadcast keys or values.
const RESERVED_BYTES: &[char] = &['|', '~', '%', '&', '='];

/// The kind of a shared subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Hash,
    Queue,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Hash => "hash",
            SubjectKind::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "hash" => Ok(SubjectKind::Hash),
            "queue" => Ok(SubjectKind::Queue),
            other => Err(CoreError::Invalid(format!("unknown subject type '{other}'"))),
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The command carried in a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeCmd {
    Update,
    BcRequest,
    BcReply,
    Delete,
}

impl EnvelopeCmd {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeCmd::Update => "update",
            EnvelopeCmd::BcRequest => "bcrequest",
            EnvelopeCmd::BcReply => "bcreply",
            EnvelopeCmd::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "update" => Ok(EnvelopeCmd::Update),
            "bcrequest" => Ok(EnvelopeCmd::BcRequest),
            "bcreply" => Ok(EnvelopeCmd::BcReply),
            "delete" => Ok(EnvelopeCmd::Delete),
            other => Err(CoreError::Invalid(format!("unknown bus command '{other}'"))),
        }
    }
}

/// A parsed message body.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub cmd: EnvelopeCmd,
    pub subject: String,
    pub kind: SubjectKind,
    pub reply: Option<String>,
    pub pairs: Option<String>,
    pub keys: Option<String>,
}

impl Envelope {
    /// Renders the body in wire form.
    pub fn to_body(&self) -> String {
        let mut out = format!(
            "{TAG_CMD}={}&{TAG_SUBJECT}={}&{TAG_TYPE}={}",
            self.cmd.as_str(),
            self.subject,
            self.kind
        );

        if let Some(reply) = &self.reply {
            out.push_str(&format!("&{TAG_REPLY}={reply}"));
        }
        if let Some(pairs) = &self.pairs {
            out.push_str(&format!("&{TAG_PAIRS}={pairs}"));
        }
        if let Some(keys) = &self.keys {
            out.push_str(&format!("&{TAG_KEYS}={keys}"));
        }

        out
    }

    /// Parses a wire body into an envelope.
    pub fn parse_body(body: &str) -> Result<Self, CoreError> {
        let mut cmd = None;
        let mut subject = None;
        let mut kind = None;
        let mut reply = None;
        let mut pairs = None;
        let mut keys = None;

        for part in body.split('&') {
            let Some((k, v)) = part.split_once('=') else {
                continue;
            };

            match k {
                TAG_CMD => cmd = Some(EnvelopeCmd::parse(v)?),
                TAG_SUBJECT => subject = Some(v.to_string()),
                TAG_TYPE => kind = Some(SubjectKind::parse(v)?),
                TAG_REPLY => reply = Some(v.to_string()),
                TAG_PAIRS => pairs = Some(v.to_string()),
                TAG_KEYS => keys = Some(v.to_string()),
                _ => {}
            }
        }

        let subject =
            subject.ok_or_else(|| CoreError::Invalid("no subject in message body".to_string()))?;
        let kind =
            kind.ok_or_else(|| CoreError::Invalid("no hash type in message body".to_string()))?;
        let cmd = cmd.ok_or_else(|| CoreError::Invalid("no command in message body".to_string()))?;

        Ok(Self {
            cmd,
            subject,
            kind,
            reply,
            pairs,
            keys,
        })
    }
}

/// Rejects keys and values carrying protocol delimiter bytes.
fn check_wire_safe(s: &str) -> Result<(), CoreError> {
    if s.contains(RESERVED_BYTES) {
        return Err(CoreError::Invalid(format!(
            "value contains reserved wire bytes: '{s}'"
        )));
    }
    Ok(())
}

/// Encodes key/value/change-id triples as `|<key>~<value>%<change_id>...`.
pub fn encode_pairs<'a, I>(triples: I) -> Result<String, CoreError>
where
    I: IntoIterator<Item = (&'a str, &'a str, u64)>,
{
    let mut out = String::new();

    for (key, value, change_id) in triples {
        check_wire_safe(key)?;
        check_wire_safe(value)?;
        out.push('|');
        out.push_str(key);
        out.push('~');
        out.push_str(value);
        out.push('%');
        out.push_str(&change_id.to_string());
    }

    Ok(out)
}

/// Decodes a `pairs` tag. The number of `|`, `~` and `%` delimiters must
/// agree, each triple yielding one key/value/change-id.
pub fn parse_pairs(val: &str) -> Result<Vec<(String, String, u64)>, CoreError> {
    let mut key_start = Vec::new();
    let mut value_start = Vec::new();
    let mut cid_start = Vec::new();

    for (i, b) in val.bytes().enumerate() {
        match b {
            b'|' => key_start.push(i),
            b'~' => value_start.push(i),
            b'%' => cid_start.push(i),
            _ => {}
        }
    }

    if key_start.len() != value_start.len() || key_start.len() != cid_start.len() {
        return Err(CoreError::Invalid(
            "update: parsing error in pairs tag".to_string(),
        ));
    }

    let mut triples = Vec::with_capacity(key_start.len());

    for i in 0..key_start.len() {
        // Delimiters must interleave as |...~...%... per triple.
        if key_start[i] >= value_start[i]
            || value_start[i] >= cid_start[i]
            || (i + 1 < key_start.len() && cid_start[i] >= key_start[i + 1])
        {
            return Err(CoreError::Invalid(
                "update: parsing error in pairs tag".to_string(),
            ));
        }

        let key = &val[key_start[i] + 1..value_start[i]];
        let value = &val[value_start[i] + 1..cid_start[i]];
        let cid = if i == key_start.len() - 1 {
            &val[cid_start[i] + 1..]
        } else {
            &val[cid_start[i] + 1..key_start[i + 1]]
        };

        let cid: u64 = cid
            .parse()
            .map_err(|_| CoreError::Invalid("update: parsing error in pairs tag".to_string()))?;
        triples.push((key.to_string(), value.to_string(), cid));
    }

    Ok(triples)
}

/// Encodes deletion keys as `|<key>|<key>...`.
pub fn encode_keys<'a, I>(keys: I) -> Result<String, CoreError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();

    for key in keys {
        check_wire_safe(key)?;
        out.push('|');
        out.push_str(key);
    }

    Ok(out)
}

/// Decodes a `keys` tag.
pub fn parse_keys(val: &str) -> Vec<String> {
    val.split('|')
        .filter(|k| !k.is_empty())
        .map(|k| k.to_string())
        .collect()
}

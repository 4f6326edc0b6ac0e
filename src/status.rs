use std::fmt;

use thiserror::Error;

// Frame delimiters as sent by the UPS.
const FRAME_START: &str = "$ ";
const FRAME_END: &str = " $";

// Field keys, each followed by a single space on the wire.
const VERSION_KEY: &str = "SmartUPS ";
const VIN_KEY: &str = ",Vin ";
const BATCAP_KEY: &str = "BATCAP ";
const VOUT_KEY: &str = ",Vout ";

const FIELD_SEPARATOR: char = ',';

// Sentinel sent in place of the input voltage when mains is absent.
const VIN_NO_GOOD: &str = "NG";
const BATCAP_FULL: &str = "100";

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    #[error("no `$ ... $` frame in chunk")]
    NoFrame,
    #[error("frame has no `{0}` field")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    Discharging,
    Charged,
    Charging,
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ChargeState::Discharging => "Discharging",
            ChargeState::Charged => "Charged",
            ChargeState::Charging => "Charging",
        };
        f.write_str(name)
    }
}

/// The four text fields carried by one status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFields {
    pub version: String,
    pub vin: String,
    pub batcap: String,
    pub vout: String,
}

impl StatusFields {
    pub fn charge_state(&self) -> ChargeState {
        classify(&self.vin, &self.batcap)
    }

    /// The persisted form of this reading, terminator included.
    pub fn status_line(&self) -> String {
        format(self.charge_state(), &self.batcap, &self.vout)
    }
}

/// Decodes one raw chunk read from the UPS.
///
/// Bytes outside the ASCII range are dropped before the frame is searched for, so line
/// noise around (or inside) a frame does not fail the decode. Only the first frame in the
/// chunk is considered.
pub fn decode(raw: &[u8]) -> Result<StatusFields, DecodeError> {
    let text: String = raw
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect();

    let body = frame_body(&text).ok_or(DecodeError::NoFrame)?;

    Ok(StatusFields {
        version: delimited_field(body, VERSION_KEY, "version")?.to_string(),
        vin: delimited_field(body, VIN_KEY, "vin")?.to_string(),
        batcap: delimited_field(body, BATCAP_KEY, "batcap")?.to_string(),
        vout: trailing_field(body, VOUT_KEY, "vout")?.to_string(),
    })
}

pub fn classify(vin: &str, batcap: &str) -> ChargeState {
    if vin == VIN_NO_GOOD {
        ChargeState::Discharging
    } else if batcap == BATCAP_FULL {
        ChargeState::Charged
    } else {
        ChargeState::Charging
    }
}

pub fn format(state: ChargeState, batcap: &str, vout: &str) -> String {
    format!("{}({}%,{}mV)\n", state, batcap, vout)
}

// The body may span lines; the closing delimiter is the first one after the opening.
fn frame_body(text: &str) -> Option<&str> {
    let start = text.find(FRAME_START)? + FRAME_START.len();
    let rest = &text[start..];
    let end = rest.find(FRAME_END)?;
    Some(&rest[..end])
}

// Value runs from the key to the next separator on the same line.
fn delimited_field<'a>(
    body: &'a str,
    key: &str,
    name: &'static str,
) -> Result<&'a str, DecodeError> {
    for (at, _) in body.match_indices(key) {
        let rest = &body[at + key.len()..];
        let end = match rest.find(|c: char| c == FIELD_SEPARATOR || c == '\n') {
            Some(end) if rest[end..].starts_with(FIELD_SEPARATOR) => end,
            _ => continue,
        };
        return non_empty(&rest[..end], name);
    }
    Err(DecodeError::MissingField(name))
}

// Value runs from the key to the end of its line.
fn trailing_field<'a>(
    body: &'a str,
    key: &str,
    name: &'static str,
) -> Result<&'a str, DecodeError> {
    let at = body.find(key).ok_or(DecodeError::MissingField(name))?;
    let rest = &body[at + key.len()..];
    let end = rest.find('\n').unwrap_or(rest.len());
    non_empty(&rest[..end], name)
}

fn non_empty<'a>(value: &'a str, name: &'static str) -> Result<&'a str, DecodeError> {
    if value.is_empty() {
        return Err(DecodeError::MissingField(name));
    }
    Ok(value)
}

//! Admin wire protocol framing.
//!
//! A call arrives as `<source>\0<method>\0<dest>\0<argument>\0<payload>`.
//! The method name may carry the argument inline after a `+` separator
//! (`admin.vm.property.Set+netvm`), which keeps per-argument policy rules
//! possible on the transport side. Responses are either
//! `0\x00<output>` or `2\x00<type>\x00<traceback>\x00<message>\x00`.

use crate::{Event, QubesError, QubesResult};

pub const RESPONSE_OK: u8 = b'0';
pub const RESPONSE_EXCEPTION: u8 = b'2';

/// Maximum accepted size of a single admin call frame.
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRequest {
    /// Caller's domain name, supplied by the transport and trusted.
    pub source: String,
    pub method: String,
    /// Target domain name, or `dom0`.
    pub dest: String,
    pub argument: String,
    pub payload: Vec<u8>,
}

fn field(raw: &[u8], what: &str) -> QubesResult<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| QubesError::protocol(format!("{} is not valid utf-8", what)))
}

pub fn parse_request(buf: &[u8]) -> QubesResult<AdminRequest> {
    if buf.len() > MAX_REQUEST_LEN {
        return Err(QubesError::protocol("request too large"));
    }
    let mut parts = buf.splitn(5, |b| *b == 0);
    let source = field(
        parts.next().ok_or(QubesError::protocol("missing source"))?,
        "source",
    )?;
    let method = field(
        parts.next().ok_or(QubesError::protocol("missing method"))?,
        "method",
    )?;
    let dest = field(
        parts.next().ok_or(QubesError::protocol("missing dest"))?,
        "dest",
    )?;
    let argument = field(
        parts.next().ok_or(QubesError::protocol("missing argument"))?,
        "argument",
    )?;
    let payload = parts.next().unwrap_or_default().to_vec();

    if source.is_empty() || method.is_empty() || dest.is_empty() {
        return Err(QubesError::protocol("empty source, method or dest"));
    }

    // the argument may ride inline on the method name
    let (method, argument) = match method.split_once('+') {
        Some((stem, inline)) => {
            if !argument.is_empty() && argument != inline {
                return Err(QubesError::protocol(
                    "argument given both inline and as a field",
                ));
            }
            (stem.to_string(), inline.to_string())
        }
        None => (method, argument),
    };
    if argument.contains('+') {
        return Err(QubesError::protocol("argument must not contain '+'"));
    }

    Ok(AdminRequest {
        source,
        method,
        dest,
        argument,
        payload,
    })
}

pub fn encode_ok(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(RESPONSE_OK);
    out.push(0);
    out.extend_from_slice(payload);
    out
}

pub fn encode_error(err: &QubesError) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(RESPONSE_EXCEPTION);
    out.push(0);
    out.extend_from_slice(err.kind_name().as_bytes());
    out.push(0);
    // traceback slot kept for wire compatibility; never filled with
    // internals
    out.push(0);
    out.extend_from_slice(err.to_string().as_bytes());
    out.push(0);
    out
}

/// One event frame on the `admin.Events` stream:
/// `<subject>\0<event>\0<key>=<value>\0…\n`.
pub fn encode_event(subject: &str, event: &Event) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(subject.as_bytes());
    out.push(0);
    out.extend_from_slice(event.name.as_bytes());
    out.push(0);
    for (k, v) in &event.kwargs {
        out.extend_from_slice(k.as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out.push(b'\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let req = parse_request(b"dom0\0admin.vm.List\0dom0\0\0").unwrap();
        assert_eq!(req.source, "dom0");
        assert_eq!(req.method, "admin.vm.List");
        assert_eq!(req.dest, "dom0");
        assert_eq!(req.argument, "");
        assert!(req.payload.is_empty());
    }

    #[test]
    fn parse_inline_argument() {
        let req = parse_request(b"work\0admin.vm.property.Get+netvm\0work\0\0").unwrap();
        assert_eq!(req.method, "admin.vm.property.Get");
        assert_eq!(req.argument, "netvm");
    }

    #[test]
    fn parse_payload_may_contain_nul() {
        let req = parse_request(b"dom0\0admin.vm.feature.Set+x\0work\0\0a\0b").unwrap();
        assert_eq!(req.payload, b"a\0b");
    }

    #[test]
    fn parse_rejects_conflicting_argument() {
        assert!(parse_request(b"dom0\0admin.vm.property.Get+netvm\0work\0label\0").is_err());
    }

    #[test]
    fn encode_responses() {
        assert_eq!(encode_ok(b"out"), b"0\0out");
        let err = QubesError::not_found("domain", "work");
        let frame = encode_error(&err);
        assert!(frame.starts_with(b"2\0NotFound\0\0"));
        assert!(frame.ends_with(b"\0"));
    }

    #[test]
    fn encode_event_frame() {
        let ev = Event::new("property-set:netvm").arg("newvalue", "sys-net");
        let frame = encode_event("work", &ev);
        assert_eq!(
            frame,
            b"work\0property-set:netvm\0newvalue=sys-net\0\n".to_vec()
        );
    }
}

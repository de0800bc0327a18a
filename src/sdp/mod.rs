//! SDP codec preference rewriting.
//!
//! Moves the payload type of a preferred codec to the front of an `m=` line
//! so the remote side picks it first. Everything else in the blob is left
//! untouched.

/// Media section an `m=` line describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Reorder the `m=<kind>` line of `sdp` so `codec` is listed first.
///
/// Returns the input unchanged when `codec` is empty, when there is no
/// `m=<kind>` line, or when no `a=rtpmap` line names the codec.
pub fn prefer_codec(sdp: &str, kind: MediaKind, codec: &str) -> String {
    if codec.is_empty() {
        return sdp.to_string();
    }

    let separator = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = sdp.split(separator).map(str::to_string).collect();

    let media_prefix = format!("m={}", kind.as_str());
    let Some(m_line_index) = lines.iter().position(|l| l.starts_with(&media_prefix)) else {
        return sdp.to_string();
    };

    let Some(payload) = find_codec_payload(&lines, codec) else {
        return sdp.to_string();
    };

    match set_default_payload(&lines[m_line_index], &payload) {
        Some(rewritten) => lines[m_line_index] = rewritten,
        None => return sdp.to_string(),
    }

    lines.join(separator)
}

/// Apply audio and video preferences in one pass.
pub fn prefer_codecs(sdp: &str, audio: Option<&str>, video: Option<&str>) -> String {
    let mut result = sdp.to_string();
    if let Some(codec) = audio {
        result = prefer_codec(&result, MediaKind::Audio, codec);
    }
    if let Some(codec) = video {
        result = prefer_codec(&result, MediaKind::Video, codec);
    }
    result
}

/// Extract the session id from the `o=` origin line.
pub fn session_id(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|l| l.trim_end_matches('\r').strip_prefix("o="))
        .and_then(|origin| origin.split_whitespace().nth(1))
        .map(str::to_string)
}

/// Scan backward for `a=rtpmap:<pt> <codec>/...` and return `<pt>`.
fn find_codec_payload(lines: &[String], codec: &str) -> Option<String> {
    let needle = codec.to_ascii_lowercase();
    lines.iter().rev().find_map(|line| {
        let rest = line.strip_prefix("a=rtpmap:")?;
        if !rest.to_ascii_lowercase().contains(&needle) {
            return None;
        }
        let (payload, _) = rest.split_once(' ')?;
        if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(payload.to_string())
    })
}

/// Rebuild `m=<media> <port> <proto> <fmt>...` with `payload` as the first format.
fn set_default_payload(m_line: &str, payload: &str) -> Option<String> {
    let fields: Vec<&str> = m_line.split(' ').collect();
    if fields.len() < 3 {
        return None;
    }

    let mut rewritten: Vec<&str> = fields[..3].to_vec();
    rewritten.push(payload);
    rewritten.extend(fields[3..].iter().copied().filter(|f| *f != payload));
    Some(rewritten.join(" "))
}

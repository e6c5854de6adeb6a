// Line-level progress heuristics for the extractor's stdout stream.
use super::*;

pub(crate) const PROGRESS_MARKER: &str = "AF_PROGRESS|";
pub(crate) const OUTPUT_MARKER: &str = "AF_OUTPUT|";
pub(crate) const PROCESSING_MESSAGE: &str = "Processing...";
const DOWNLOAD_PREFIX: &str = "[download]";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProgressEvent {
    NoOp,
    Message(String),
    Progress(f32),
    OutputPath(String),
}

pub(crate) fn parse_u64_field(value: Option<&str>) -> Option<u64> {
    value.and_then(|raw| raw.trim().parse::<u64>().ok())
}

pub(crate) fn parse_progress_ratio_from_parts(
    downloaded: Option<u64>,
    total: Option<u64>,
    total_estimate: Option<u64>,
) -> Option<f32> {
    let downloaded = downloaded?;
    let baseline = total.or(total_estimate)?;
    if baseline == 0 {
        return None;
    }
    Some(downloaded as f32 / baseline as f32)
}

fn is_destination_line(line: &str) -> bool {
    line.contains("Destination:")
}

// Other tool lines can echo percent-encoded URLs, so only these are read as progress.
fn may_carry_percent(line: &str) -> bool {
    line.starts_with(DOWNLOAD_PREFIX)
        || line
            .chars()
            .next()
            .map(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+'))
            .unwrap_or(false)
}

fn extract_percent(line: &str) -> Option<Result<f32, String>> {
    let marker = line.find('%')?;
    let head = line[..marker].trim_end();
    let token_start = head
        .char_indices()
        .rev()
        .find(|(_, ch)| !(ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+')))
        .map(|(index, ch)| index + ch.len_utf8())
        .unwrap_or(0);
    let token = &head[token_start..];
    if token.is_empty() {
        return None;
    }
    match token.parse::<f32>() {
        Ok(value) if value.is_finite() && (0.0..=100.0).contains(&value) => Some(Ok(value)),
        Ok(value) => Some(Err(format!("percentage out of range: {value}"))),
        Err(error) => Some(Err(format!("malformed percentage {token:?}: {error}"))),
    }
}

fn parse_progress_template(stripped: &str) -> ProgressEvent {
    let parts: Vec<&str> = stripped.split('|').collect();
    let percent_hint = parts.get(3).and_then(|raw| extract_percent(raw));
    match percent_hint {
        Some(Ok(value)) => return ProgressEvent::Progress(value),
        Some(Err(error)) => {
            log::warn!("Ignoring progress line: {error}");
            return ProgressEvent::NoOp;
        }
        None => {}
    }

    let downloaded = parse_u64_field(parts.first().copied());
    let total = parse_u64_field(parts.get(1).copied());
    let total_estimate = parse_u64_field(parts.get(2).copied());
    match parse_progress_ratio_from_parts(downloaded, total, total_estimate) {
        Some(ratio) if (0.0..=1.0).contains(&ratio) => ProgressEvent::Progress(ratio * 100.0),
        Some(ratio) => {
            log::warn!("Ignoring progress line: byte ratio out of range: {ratio}");
            ProgressEvent::NoOp
        }
        None => ProgressEvent::NoOp,
    }
}

pub(crate) fn parse_progress_line(line: &str) -> ProgressEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ProgressEvent::NoOp;
    }

    if let Some(stripped) = trimmed.strip_prefix(OUTPUT_MARKER) {
        return match normalize_output_path_from_ytdlp(stripped) {
            Some(path) => ProgressEvent::OutputPath(path),
            None => ProgressEvent::NoOp,
        };
    }

    if is_destination_line(trimmed) {
        return ProgressEvent::Message(PROCESSING_MESSAGE.to_string());
    }

    if let Some(stripped) = trimmed.strip_prefix(PROGRESS_MARKER) {
        return parse_progress_template(stripped);
    }

    if !may_carry_percent(trimmed) {
        return ProgressEvent::NoOp;
    }
    match extract_percent(trimmed) {
        Some(Ok(value)) => ProgressEvent::Progress(value),
        Some(Err(error)) => {
            log::warn!("Ignoring progress line {trimmed:?}: {error}");
            ProgressEvent::NoOp
        }
        None => ProgressEvent::NoOp,
    }
}

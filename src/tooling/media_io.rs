// Process line IO, output-directory lookups and audio file helpers.
use super::*;

pub(crate) const DIAGNOSTIC_TAIL_LINES: usize = 32;
const PARTIAL_FILE_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".tmp"];

pub(crate) fn read_lossy_process_line<R: BufRead>(
    reader: &mut R,
    raw_buffer: &mut Vec<u8>,
) -> Result<Option<String>, std::io::Error> {
    raw_buffer.clear();
    let bytes_read = reader.read_until(b'\n', raw_buffer)?;
    if bytes_read == 0 {
        return Ok(None);
    }
    while matches!(raw_buffer.last(), Some(b'\n' | b'\r')) {
        raw_buffer.pop();
    }
    Ok(Some(String::from_utf8_lossy(raw_buffer).to_string()))
}

pub(crate) fn normalize_output_path_from_ytdlp(line: &str) -> Option<String> {
    let trimmed = line.trim().trim_matches('"');
    if trimmed.is_empty() {
        return None;
    }
    let normalized = trimmed.strip_prefix("\\\\?\\").unwrap_or(trimmed);
    Some(normalized.to_string())
}

#[derive(Debug, Default, Clone)]
pub(crate) struct DiagnosticTail {
    lines: VecDeque<String>,
}

impl DiagnosticTail {
    pub(crate) fn push(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if self.lines.len() >= DIAGNOSTIC_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(trimmed.to_string());
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub(crate) fn last_line(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub(crate) fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn is_partial_file(name: &str) -> bool {
    PARTIAL_FILE_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

pub(crate) fn list_files_with_stem(dir: &Path, stem: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let candidate = entry.path();
        if !candidate.is_file() {
            continue;
        }
        let Some(name) = candidate.file_name().and_then(|value| value.to_str()) else {
            continue;
        };
        if name.starts_with(stem) && !is_partial_file(name) {
            files.push(candidate);
        }
    }
    files.sort();
    files
}

pub(crate) fn remove_stem_files(dir: &Path, stem: &str) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let candidate = entry.path();
        let matches_stem = candidate
            .file_name()
            .and_then(|value| value.to_str())
            .map(|name| name.starts_with(stem))
            .unwrap_or(false);
        if matches_stem && candidate.is_file() {
            if let Err(error) = fs::remove_file(&candidate) {
                log::warn!("Failed to remove {}: {error}", candidate.display());
            }
        }
    }
}

pub(crate) fn audio_mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" | "aac" => "audio/mp4",
        "opus" | "ogg" | "oga" | "vorbis" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

pub(crate) fn unique_file_name(dir: &Path, stem: &str, suffix: &str, extension: &str) -> String {
    let extension = extension.trim_start_matches('.');
    let with_extension = |base: &str| {
        if extension.is_empty() {
            base.to_string()
        } else {
            format!("{base}.{extension}")
        }
    };
    let candidate = with_extension(stem);
    if !dir.join(&candidate).exists() {
        return candidate;
    }
    let suffixed = with_extension(&format!("{stem}-{suffix}"));
    if !dir.join(&suffixed).exists() {
        return suffixed;
    }
    let mut index = 2_u32;
    loop {
        let numbered = with_extension(&format!("{stem}-{suffix}-{index}"));
        if !dir.join(&numbered).exists() {
            return numbered;
        }
        index += 1;
    }
}

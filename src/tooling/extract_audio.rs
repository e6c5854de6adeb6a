// One audio extraction attempt: spawn yt-dlp, stream its output and locate the result.
use super::*;

static PUBLISH_LOCK: Mutex<()> = Mutex::new(());
pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct ExtractionRequest<'a> {
    pub(crate) url: &'a str,
    pub(crate) stem: &'a str,
    pub(crate) output_dir: &'a Path,
    pub(crate) tools: &'a ResolvedTools,
    pub(crate) settings: &'a ServiceSettings,
}

fn apply_network_args(command: &mut Command, settings: &ServiceSettings) {
    command
        .arg("--socket-timeout")
        .arg(settings.socket_timeout_secs().to_string())
        .arg("--user-agent")
        .arg(&settings.user_agent);
    if let Some(cookies) = settings.cookies_file.as_ref() {
        command.arg("--cookies").arg(cookies);
    }
    if let Some(proxy) = settings.proxy_url.as_ref() {
        command.arg("--proxy").arg(proxy);
    }
}

pub(crate) fn build_extract_command(request: &ExtractionRequest<'_>) -> Command {
    let output_template = request
        .output_dir
        .join(format!("{}.%(ext)s", request.stem));
    let mut command = hidden_command(&request.tools.ytdlp);
    command
        .arg("--no-playlist")
        .arg("--newline")
        .arg("--progress")
        .arg("--no-quiet")
        .arg("--no-colors")
        .arg("--no-warnings")
        .arg("--no-mtime")
        .arg("--progress-template")
        .arg(format!(
            "download:{PROGRESS_MARKER}%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress._percent_str)s"
        ))
        .arg("--print")
        .arg(format!("after_move:{OUTPUT_MARKER}%(filepath)s"))
        .arg("-f")
        .arg("bestaudio/best")
        .arg("--extract-audio")
        .arg("--audio-format")
        .arg(&request.settings.audio_format)
        .arg("--audio-quality")
        .arg(&request.settings.audio_quality);
    apply_network_args(&mut command, request.settings);
    if let Some(location) = request
        .tools
        .ffmpeg
        .as_ref()
        .and_then(|path| path.parent())
    {
        command.arg("--ffmpeg-location").arg(location);
    }
    command
        .arg("-o")
        .arg(output_template.to_string_lossy().to_string())
        .arg(request.url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

fn join_reader(stream: &str, handle: thread::JoinHandle<()>) {
    if let Err(panic) = handle.join() {
        log::warn!("yt-dlp {stream} reader panicked: {panic:?}");
    }
}

pub(crate) fn run_extraction_attempt(
    request: &ExtractionRequest<'_>,
    is_cancelled: &dyn Fn() -> bool,
    on_event: &mut dyn FnMut(ProgressEvent),
) -> Result<PathBuf, DownloadFailure> {
    let mut child = build_extract_command(request)
        .spawn()
        .map_err(|error| DownloadFailure::generic(format!("Failed to start yt-dlp: {error}")))?;
    let stdout = child.stdout.take().ok_or_else(|| {
        DownloadFailure::generic("Failed to capture stdout for progress tracking.")
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        DownloadFailure::generic("Failed to capture stderr for error reporting.")
    })?;

    let stderr_tail: Arc<Mutex<DiagnosticTail>> = Arc::new(Mutex::new(DiagnosticTail::default()));
    let stderr_tail_for_thread = Arc::clone(&stderr_tail);
    let stderr_handle = thread::spawn(move || {
        let mut stderr_reader = BufReader::new(stderr);
        let mut raw_buffer = Vec::<u8>::new();
        loop {
            match read_lossy_process_line(&mut stderr_reader, &mut raw_buffer) {
                Ok(Some(current_line)) => {
                    stderr_tail_for_thread
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&current_line);
                }
                Ok(None) => break,
                Err(error) => {
                    stderr_tail_for_thread
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&format!("Failed to read yt-dlp stderr: {error}"));
                    break;
                }
            }
        }
    });

    let (line_sender, line_receiver) = mpsc::channel::<Result<String, String>>();
    let stdout_handle = thread::spawn(move || {
        let mut stdout_reader = BufReader::new(stdout);
        let mut raw_buffer = Vec::<u8>::new();
        loop {
            let message = match read_lossy_process_line(&mut stdout_reader, &mut raw_buffer) {
                Ok(Some(current_line)) => Ok(current_line),
                Ok(None) => break,
                Err(error) => Err(format!("Failed to read yt-dlp progress stream: {error}")),
            };
            let stop = message.is_err();
            if line_sender.send(message).is_err() || stop {
                break;
            }
        }
    });

    let mut reported_outputs: Vec<String> = Vec::new();
    let mut stdout_tail = DiagnosticTail::default();
    let mut read_error: Option<String> = None;
    loop {
        if is_cancelled() {
            break;
        }
        let current_line = match line_receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(Ok(value)) => value,
            Ok(Err(error)) => {
                read_error = Some(error);
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match parse_progress_line(&current_line) {
            ProgressEvent::NoOp => stdout_tail.push(&current_line),
            ProgressEvent::OutputPath(path) => {
                if reported_outputs.len() >= DIAGNOSTIC_TAIL_LINES {
                    reported_outputs.remove(0);
                }
                reported_outputs.push(path.clone());
                on_event(ProgressEvent::OutputPath(path));
            }
            event => on_event(event),
        }
    }

    let cancelled = is_cancelled();
    if cancelled || read_error.is_some() {
        if let Err(error) = child.kill() {
            log::debug!("yt-dlp already exited before kill: {error}");
        }
    }
    let status = child.wait();

    if cancelled {
        // Readers are left detached: processes spawned by yt-dlp may still hold the pipes.
        remove_stem_files(request.output_dir, request.stem);
        return Err(DownloadFailure::Cancelled);
    }
    join_reader("stdout", stdout_handle);
    join_reader("stderr", stderr_handle);
    if let Some(error) = read_error {
        return Err(DownloadFailure::generic(error));
    }
    let status = status.map_err(|error| {
        DownloadFailure::generic(format!("Failed while waiting for yt-dlp to finish: {error}"))
    })?;

    if !status.success() {
        let stderr_tail = stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let diagnostics = if stderr_tail.is_empty() {
            &stdout_tail
        } else {
            &stderr_tail
        };
        if let Some(line) = diagnostics.last_line() {
            log::debug!("yt-dlp exited with {status}: {line}");
        }
        let raw = diagnostics.text();
        let raw = if raw.is_empty() {
            format!("yt-dlp exited with {status}")
        } else {
            raw
        };
        return Err(classify_failure(&raw));
    }

    resolve_output_file(request.output_dir, request.stem, &reported_outputs)
}

pub(crate) fn resolve_output_file(
    output_dir: &Path,
    stem: &str,
    reported_outputs: &[String],
) -> Result<PathBuf, DownloadFailure> {
    let output_dir_canonical = fs::canonicalize(output_dir).map_err(|error| {
        DownloadFailure::generic(format!("Failed to resolve output directory: {error}"))
    })?;
    for candidate in reported_outputs.iter().rev() {
        let mut candidate_path = PathBuf::from(candidate);
        if candidate_path.is_relative() {
            candidate_path = output_dir.join(candidate_path);
        }
        if !candidate_path.is_file() {
            continue;
        }
        let Ok(canonical_candidate) = fs::canonicalize(&candidate_path) else {
            continue;
        };
        if canonical_candidate.starts_with(&output_dir_canonical) {
            return Ok(canonical_candidate);
        }
        log::warn!(
            "Ignoring reported output outside the output directory: {}",
            canonical_candidate.display()
        );
    }

    let matches = list_files_with_stem(output_dir, stem);
    match matches.as_slice() {
        [] => {
            log::error!("Produced file missing for stem {stem} in {}", output_dir.display());
            Err(DownloadFailure::generic("produced file missing"))
        }
        [single] => Ok(single.clone()),
        many => {
            let names = many
                .iter()
                .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
                .collect::<Vec<_>>()
                .join(" | ");
            log::error!("Produced file ambiguous for stem {stem}: {names}");
            Err(DownloadFailure::generic(format!(
                "produced file ambiguous ({} candidates)",
                many.len()
            )))
        }
    }
}

pub(crate) fn resolve_title(
    tools: &ResolvedTools,
    settings: &ServiceSettings,
    url: &str,
) -> Option<String> {
    let mut command = hidden_command(&tools.ytdlp);
    command
        .arg("--skip-download")
        .arg("--no-playlist")
        .arg("--no-warnings")
        .arg("--print")
        .arg("title");
    apply_network_args(&mut command, settings);
    let output = command.arg(url).output().ok()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::warn!(
            "Title lookup failed: {}",
            stderr.lines().last().unwrap_or("yt-dlp failed.")
        );
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

pub(crate) fn publish_output(
    output_dir: &Path,
    produced: &Path,
    title: Option<&str>,
    stem: &str,
    fallback_extension: &str,
) -> Result<String, String> {
    let short_stem: String = stem
        .chars()
        .rev()
        .take(8)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let base = title
        .and_then(sanitize_file_stem)
        .unwrap_or_else(|| format!("audio-{short_stem}"));
    let extension = produced
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| fallback_extension.to_string());

    let _guard = PUBLISH_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let file_name = unique_file_name(output_dir, &base, &short_stem, &extension);
    fs::rename(produced, output_dir.join(&file_name))
        .map_err(|error| format!("Failed to move output into place: {error}"))?;
    Ok(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> ResolvedTools {
        ResolvedTools {
            ytdlp: PathBuf::from("/opt/bin/yt-dlp"),
            ffmpeg: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
        }
    }

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn command_requests_audio_progress_and_exact_output() {
        let settings = ServiceSettings {
            cookies_file: Some("/etc/cookies.txt".to_string()),
            proxy_url: Some("socks5://127.0.0.1:9050".to_string()),
            ..ServiceSettings::default()
        };
        let tools = tools();
        let request = ExtractionRequest {
            url: "https://youtu.be/abc",
            stem: "af-1234",
            output_dir: Path::new("/srv/out"),
            tools: &tools,
            settings: &settings,
        };
        let command = build_extract_command(&request);
        let args = args_of(&command);
        let pair = |flag: &str| {
            args.iter()
                .position(|arg| arg == flag)
                .and_then(|index| args.get(index + 1))
                .cloned()
        };

        assert_eq!(command.get_program(), "/opt/bin/yt-dlp");
        assert!(args.contains(&"--extract-audio".to_string()));
        assert!(args.contains(&"--newline".to_string()));
        assert!(args.contains(&"--no-mtime".to_string()));
        assert_eq!(pair("-f").as_deref(), Some("bestaudio/best"));
        assert_eq!(pair("--audio-format").as_deref(), Some("mp3"));
        assert_eq!(pair("--audio-quality").as_deref(), Some("0"));
        assert_eq!(pair("--cookies").as_deref(), Some("/etc/cookies.txt"));
        assert_eq!(pair("--proxy").as_deref(), Some("socks5://127.0.0.1:9050"));
        assert_eq!(pair("--user-agent").as_deref(), Some(DEFAULT_USER_AGENT));
        assert_eq!(pair("--ffmpeg-location").as_deref(), Some("/opt/ffmpeg/bin"));
        assert_eq!(pair("-o").as_deref(), Some("/srv/out/af-1234.%(ext)s"));
        assert!(pair("--print").unwrap().starts_with("after_move:AF_OUTPUT|"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }

    #[test]
    fn panicked_reader_is_logged_not_propagated() {
        let handle = thread::spawn(|| -> () { panic!("reader failed") });
        join_reader("stderr", handle);
    }

    #[test]
    fn optional_network_args_are_omitted() {
        let settings = ServiceSettings::default();
        let tools = ResolvedTools {
            ytdlp: PathBuf::from("yt-dlp"),
            ffmpeg: None,
        };
        let request = ExtractionRequest {
            url: "https://example.com/v",
            stem: "af-1",
            output_dir: Path::new("/tmp"),
            tools: &tools,
            settings: &settings,
        };
        let args = args_of(&build_extract_command(&request));
        assert!(!args.contains(&"--cookies".to_string()));
        assert!(!args.contains(&"--proxy".to_string()));
        assert!(!args.contains(&"--ffmpeg-location".to_string()));
    }

    #[test]
    fn reported_path_wins_over_prefix_search() {
        let dir = tempfile::tempdir().unwrap();
        let exact = dir.path().join("af-9.mp3");
        fs::write(&exact, b"x").unwrap();
        fs::write(dir.path().join("af-9.m4a"), b"x").unwrap();
        let resolved = resolve_output_file(
            dir.path(),
            "af-9",
            &[exact.to_string_lossy().to_string()],
        )
        .unwrap();
        assert_eq!(resolved, fs::canonicalize(&exact).unwrap());
    }

    #[test]
    fn prefix_search_reports_missing_and_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let missing = resolve_output_file(dir.path(), "af-7", &[]).unwrap_err();
        assert_eq!(missing.kind(), FailureKind::GenericDownloadFailure);
        assert!(missing.to_string().contains("produced file missing"));

        fs::write(dir.path().join("af-7.mp3"), b"x").unwrap();
        assert!(resolve_output_file(dir.path(), "af-7", &[]).is_ok());

        fs::write(dir.path().join("af-7.opus"), b"x").unwrap();
        let ambiguous = resolve_output_file(dir.path(), "af-7", &[]).unwrap_err();
        assert_eq!(ambiguous.kind(), FailureKind::GenericDownloadFailure);
        assert!(ambiguous.to_string().contains("ambiguous"));
    }

    #[test]
    fn reported_path_outside_output_dir_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let outside = elsewhere.path().join("af-3.mp3");
        fs::write(&outside, b"x").unwrap();
        let error = resolve_output_file(
            dir.path(),
            "af-3",
            &[outside.to_string_lossy().to_string()],
        )
        .unwrap_err();
        assert!(error.to_string().contains("missing"));
    }

    #[test]
    fn publish_uses_sanitized_title_or_stem_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let produced = dir.path().join("af-0011223344.mp3");
        fs::write(&produced, b"x").unwrap();
        let name = publish_output(dir.path(), &produced, Some("Best: Song?"), "af-0011223344", "mp3")
            .unwrap();
        assert_eq!(name, "Best Song.mp3");
        assert!(dir.path().join("Best Song.mp3").exists());
        assert!(!produced.exists());

        let produced = dir.path().join("af-99887766.mp3");
        fs::write(&produced, b"x").unwrap();
        let name = publish_output(dir.path(), &produced, None, "af-99887766", "mp3").unwrap();
        assert_eq!(name, "audio-99887766.mp3");
    }

    #[test]
    fn publish_avoids_overwriting_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Song.mp3"), b"old").unwrap();
        let produced = dir.path().join("af-aabbccdd.mp3");
        fs::write(&produced, b"new").unwrap();
        let name = publish_output(dir.path(), &produced, Some("Song"), "af-aabbccdd", "mp3").unwrap();
        assert_eq!(name, "Song-aabbccdd.mp3");
        assert_eq!(fs::read(dir.path().join("Song.mp3")).unwrap(), b"old");
    }
}

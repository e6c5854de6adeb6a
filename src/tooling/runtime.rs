// Service settings, external tool resolution and input sanitation helpers.
use super::*;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "audio-fetch.json";
pub const CONFIG_PATH_ENV: &str = "AUDIO_FETCH_CONFIG";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
pub(crate) const SUPPORTED_AUDIO_FORMATS: [&str; 7] =
    ["mp3", "m4a", "opus", "wav", "flac", "aac", "vorbis"];
pub(crate) const MAX_TITLE_CHARS: usize = 120;

pub(crate) fn hidden_command(program: impl AsRef<OsStr>) -> Command {
    let mut command = Command::new(program);
    command
        .env("PYTHONIOENCODING", "UTF-8")
        .env("PYTHONUTF8", "1")
        .stdin(Stdio::null());
    command
}

fn default_listen_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_output_dir() -> String {
    "downloads".to_string()
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_audio_quality() -> String {
    "0".to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub ytdlp_path: Option<String>,
    #[serde(default)]
    pub ffmpeg_path: Option<String>,
    #[serde(default = "default_true")]
    pub require_ffmpeg: bool,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default = "default_audio_quality")]
    pub audio_quality: String,
    #[serde(default)]
    pub cookies_file: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub socket_timeout_secs: Option<u32>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_min_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub retention_secs: Option<u64>,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_true")]
    pub delete_after_download: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            output_dir: default_output_dir(),
            ytdlp_path: None,
            ffmpeg_path: None,
            require_ffmpeg: true,
            audio_format: default_audio_format(),
            audio_quality: default_audio_quality(),
            cookies_file: None,
            proxy_url: None,
            user_agent: default_user_agent(),
            socket_timeout_secs: None,
            max_attempts: None,
            backoff_min_ms: None,
            backoff_max_ms: None,
            worker_count: None,
            queue_capacity: None,
            retention_secs: None,
            sweep_interval_secs: None,
            allowed_hosts: Vec::new(),
            delete_after_download: true,
        }
    }
}

impl ServiceSettings {
    pub fn socket_timeout_secs(&self) -> u32 {
        self.socket_timeout_secs.unwrap_or(30).max(1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3).max(1)
    }

    pub fn backoff_bounds_ms(&self) -> (u64, u64) {
        let min = self.backoff_min_ms.unwrap_or(2_000);
        let max = self.backoff_max_ms.unwrap_or(15_000);
        (min.min(max), min.max(max))
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.unwrap_or(4).clamp(1, 64)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(64).max(1)
    }

    pub fn retention(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retention_secs.unwrap_or(60 * 60))
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.unwrap_or(10 * 60).max(1))
    }

    pub fn output_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, String> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|error| format!("Invalid listen address {}: {error}", self.listen_addr))
    }
}

pub(crate) fn sanitize_optional_path(value: Option<String>) -> Result<Option<String>, String> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if trimmed.len() > 512 {
                return Err("Path is too long.".to_string());
            }
            if trimmed.chars().any(|ch| ch.is_control()) {
                return Err("Path contains invalid control characters.".to_string());
            }
            Ok(Some(trimmed.to_string()))
        }
    }
}

pub fn normalize_settings(mut settings: ServiceSettings) -> Result<ServiceSettings, String> {
    settings.ytdlp_path = sanitize_optional_path(settings.ytdlp_path)?;
    settings.ffmpeg_path = sanitize_optional_path(settings.ffmpeg_path)?;
    settings.cookies_file = sanitize_optional_path(settings.cookies_file)?;
    settings.proxy_url = sanitize_optional_path(settings.proxy_url)?;
    settings.output_dir =
        sanitize_optional_path(Some(settings.output_dir))?.unwrap_or_else(default_output_dir);

    settings.audio_format = settings.audio_format.trim().to_lowercase();
    if !SUPPORTED_AUDIO_FORMATS.contains(&settings.audio_format.as_str()) {
        log::warn!(
            "Unsupported audio format {:?}, falling back to mp3",
            settings.audio_format
        );
        settings.audio_format = default_audio_format();
    }
    let quality = settings.audio_quality.trim();
    settings.audio_quality = if quality.is_empty() || quality.len() > 8 {
        default_audio_quality()
    } else {
        quality.to_string()
    };

    let user_agent = settings.user_agent.trim();
    if user_agent.chars().any(|ch| ch.is_control()) {
        return Err("User agent contains invalid control characters.".to_string());
    }
    settings.user_agent = if user_agent.is_empty() {
        default_user_agent()
    } else {
        user_agent.to_string()
    };

    if let Some(proxy) = settings.proxy_url.as_ref() {
        Url::parse(proxy).map_err(|error| format!("Invalid proxy URL: {error}"))?;
    }

    let (min, max) = settings.backoff_bounds_ms();
    settings.backoff_min_ms = Some(min);
    settings.backoff_max_ms = Some(max);
    settings.max_attempts = Some(settings.max_attempts());
    settings.worker_count = Some(settings.worker_count());
    settings.queue_capacity = Some(settings.queue_capacity());
    settings.allowed_hosts = settings
        .allowed_hosts
        .into_iter()
        .map(|host| host.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .collect();

    settings.listen_socket_addr()?;
    Ok(settings)
}

pub fn apply_env_overrides<F>(mut settings: ServiceSettings, lookup: F) -> ServiceSettings
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("AUDIO_FETCH_LISTEN") {
        settings.listen_addr = value;
    }
    if let Some(value) = lookup("AUDIO_FETCH_OUTPUT_DIR") {
        settings.output_dir = value;
    }
    if let Some(value) = lookup("PROXY_URL") {
        settings.proxy_url = Some(value);
    }
    if let Some(value) = lookup("COOKIES_FILE") {
        settings.cookies_file = Some(value);
    }
    if let Some(value) = lookup("USER_AGENT") {
        settings.user_agent = value;
    }
    if let Some(value) = lookup("MAX_ATTEMPTS") {
        match value.trim().parse::<u32>() {
            Ok(parsed) => settings.max_attempts = Some(parsed),
            Err(error) => log::warn!("Ignoring MAX_ATTEMPTS={value:?}: {error}"),
        }
    }
    settings
}

pub fn load_settings_from_path(path: &Path) -> Result<ServiceSettings, String> {
    if !path.exists() {
        return Ok(ServiceSettings::default());
    }
    let raw =
        fs::read_to_string(path).map_err(|error| format!("Failed to read settings: {error}"))?;
    serde_json::from_str(&raw).map_err(|error| format!("Failed to parse settings: {error}"))
}

pub fn load_settings() -> Result<ServiceSettings, String> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE_NAME));
    let parsed = load_settings_from_path(&path)?;
    let merged = apply_env_overrides(parsed, |key| {
        std::env::var(key).ok().filter(|value| !value.trim().is_empty())
    });
    normalize_settings(merged)
}

pub(crate) fn ensure_output_dir(settings: &ServiceSettings) -> Result<PathBuf, String> {
    let target = settings.output_dir_path();
    fs::create_dir_all(&target)
        .map_err(|error| format!("Failed to create output directory: {error}"))?;
    let canonical = fs::canonicalize(&target)
        .map_err(|error| format!("Failed to resolve output directory: {error}"))?;
    if !canonical.is_dir() {
        return Err("Output path must be a directory.".to_string());
    }
    Ok(canonical)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub name: String,
    pub available: bool,
    pub source: String,
    pub path: Option<String>,
    pub version: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeToolsStatus {
    pub ytdlp: ToolStatus,
    pub ffmpeg: ToolStatus,
    pub output_dir: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTools {
    pub ytdlp: PathBuf,
    pub ffmpeg: Option<PathBuf>,
}

pub(crate) fn ensure_custom_binary(path: &str) -> Option<PathBuf> {
    let parsed = PathBuf::from(path);
    if !parsed.exists() {
        return None;
    }
    let canonical = fs::canonicalize(&parsed).ok()?;
    if canonical.is_file() {
        Some(canonical)
    } else {
        None
    }
}

pub(crate) fn resolve_ytdlp_binary(settings: &ServiceSettings) -> Option<(PathBuf, String)> {
    if let Some(custom) = settings.ytdlp_path.as_ref() {
        return ensure_custom_binary(custom).map(|path| (path, "custom".to_string()));
    }
    which("yt-dlp")
        .ok()
        .map(|path| (path, "system".to_string()))
}

pub(crate) fn resolve_ffmpeg_binary(settings: &ServiceSettings) -> Option<(PathBuf, String)> {
    if let Some(custom) = settings.ffmpeg_path.as_ref() {
        return ensure_custom_binary(custom).map(|path| (path, "custom".to_string()));
    }
    which("ffmpeg")
        .ok()
        .map(|path| (path, "system".to_string()))
}

pub(crate) fn resolve_tools(settings: &ServiceSettings) -> Result<ResolvedTools, String> {
    let (ytdlp, _) = resolve_ytdlp_binary(settings)
        .ok_or_else(|| "yt-dlp was not found. Install it or set ytdlpPath.".to_string())?;
    let ffmpeg = resolve_ffmpeg_binary(settings).map(|(path, _)| path);
    if settings.require_ffmpeg && ffmpeg.is_none() {
        return Err("ffmpeg was not found. Install it or set ffmpegPath.".to_string());
    }
    Ok(ResolvedTools { ytdlp, ffmpeg })
}

pub(crate) fn run_version(binary: &Path, arg: &str) -> Option<String> {
    let output = hidden_command(binary).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
}

pub(crate) fn inspect_tool(
    path_with_source: Option<(PathBuf, String)>,
    name: &str,
    version_arg: &str,
) -> ToolStatus {
    match path_with_source {
        Some((path, source)) => {
            let version = run_version(&path, version_arg);
            ToolStatus {
                name: name.to_string(),
                available: version.is_some(),
                source,
                path: Some(path.to_string_lossy().to_string()),
                version,
                message: None,
            }
        }
        None => ToolStatus {
            name: name.to_string(),
            available: false,
            source: "missing".to_string(),
            path: None,
            version: None,
            message: Some("Tool not found.".to_string()),
        },
    }
}

pub(crate) fn build_runtime_status(settings: &ServiceSettings) -> RuntimeToolsStatus {
    RuntimeToolsStatus {
        ytdlp: inspect_tool(resolve_ytdlp_binary(settings), "yt-dlp", "--version"),
        ffmpeg: inspect_tool(resolve_ffmpeg_binary(settings), "ffmpeg", "-version"),
        output_dir: settings.output_dir.clone(),
    }
}

pub(crate) fn trusted_host_match(host: &str, allowed_host: &str) -> bool {
    host.eq_ignore_ascii_case(allowed_host)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", allowed_host.to_ascii_lowercase()))
}

pub(crate) fn validate_media_url(raw: &str, allowed_hosts: &[String]) -> Result<Url, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("URL is required.".to_string());
    }
    if trimmed.len() > 2048 {
        return Err("URL is too long.".to_string());
    }
    let parsed = Url::parse(trimmed).map_err(|_| "Invalid URL.".to_string())?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err("Only HTTP(S) links are allowed.".to_string());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err("Link must not include credentials.".to_string());
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| "Failed to resolve link domain.".to_string())?
        .to_lowercase();
    if !allowed_hosts.is_empty()
        && !allowed_hosts
            .iter()
            .any(|allowed| trusted_host_match(&host, allowed))
    {
        return Err(format!("Links from {host} are not supported."));
    }
    Ok(parsed)
}

pub(crate) fn sanitize_file_stem(value: &str) -> Option<String> {
    let mut normalized = String::with_capacity(value.len());
    for ch in value.trim().chars() {
        if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
            continue;
        }
        if ch.is_whitespace() {
            if !normalized.ends_with(' ') {
                normalized.push(' ');
            }
            continue;
        }
        normalized.push(ch);
    }
    let normalized: String = normalized.chars().take(MAX_TITLE_CHARS).collect();
    let normalized = normalized.trim_matches(|ch: char| ch == '.' || ch.is_whitespace());
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_string())
    }
}

pub(crate) fn is_safe_file_name(value: &str) -> bool {
    if value.is_empty() || value.len() > 512 || value.starts_with('.') {
        return false;
    }
    if value.chars().any(|ch| ch.is_control() || ch == '/' || ch == '\\') {
        return false;
    }
    let path = Path::new(value);
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_survive_normalization() {
        let settings = normalize_settings(ServiceSettings::default()).unwrap();
        assert_eq!(settings.max_attempts(), 3);
        assert_eq!(settings.backoff_bounds_ms(), (2_000, 15_000));
        assert_eq!(settings.audio_format, "mp3");
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn normalization_repairs_bounds_and_blank_values() {
        let settings = ServiceSettings {
            backoff_min_ms: Some(9_000),
            backoff_max_ms: Some(1_000),
            max_attempts: Some(0),
            cookies_file: Some("   ".to_string()),
            audio_format: "WAVE".to_string(),
            user_agent: "  ".to_string(),
            allowed_hosts: vec![" .YouTube.com ".to_string(), String::new()],
            ..ServiceSettings::default()
        };
        let settings = normalize_settings(settings).unwrap();
        assert_eq!(settings.backoff_bounds_ms(), (1_000, 9_000));
        assert_eq!(settings.max_attempts(), 1);
        assert_eq!(settings.cookies_file, None);
        assert_eq!(settings.audio_format, "mp3");
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(settings.allowed_hosts, vec!["youtube.com".to_string()]);
    }

    #[test]
    fn normalization_rejects_bad_proxy_and_listen_address() {
        let settings = ServiceSettings {
            proxy_url: Some("not a url".to_string()),
            ..ServiceSettings::default()
        };
        assert!(normalize_settings(settings).is_err());

        let settings = ServiceSettings {
            listen_addr: "localhost".to_string(),
            ..ServiceSettings::default()
        };
        assert!(normalize_settings(settings).is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = [
            ("PROXY_URL", "http://proxy.local:8080"),
            ("COOKIES_FILE", "/tmp/cookies.txt"),
            ("MAX_ATTEMPTS", "5"),
            ("USER_AGENT", "tester/1.0"),
        ]
        .into_iter()
        .collect();
        let settings = apply_env_overrides(ServiceSettings::default(), |key| {
            env.get(key).map(|value| value.to_string())
        });
        assert_eq!(settings.proxy_url.as_deref(), Some("http://proxy.local:8080"));
        assert_eq!(settings.cookies_file.as_deref(), Some("/tmp/cookies.txt"));
        assert_eq!(settings.max_attempts(), 5);
        assert_eq!(settings.user_agent, "tester/1.0");
    }

    #[test]
    fn malformed_env_attempts_are_ignored() {
        let settings = apply_env_overrides(ServiceSettings::default(), |key| {
            (key == "MAX_ATTEMPTS").then(|| "many".to_string())
        });
        assert_eq!(settings.max_attempts(), 3);
    }

    #[test]
    fn settings_file_is_optional_and_partial() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing, ServiceSettings::default());

        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "outputDir": "/srv/audio", "maxAttempts": 1 }"#).unwrap();
        let parsed = load_settings_from_path(&path).unwrap();
        assert_eq!(parsed.output_dir, "/srv/audio");
        assert_eq!(parsed.max_attempts(), 1);
        assert_eq!(parsed.audio_format, "mp3");
    }

    #[test]
    fn url_validation() {
        assert!(validate_media_url("https://www.youtube.com/watch?v=abc", &[]).is_ok());
        assert!(validate_media_url("  ", &[]).is_err());
        assert!(validate_media_url("ftp://example.com/a", &[]).is_err());
        assert!(validate_media_url("https://user:pw@example.com/", &[]).is_err());
        assert!(validate_media_url("not a url", &[]).is_err());

        let allowed = vec!["youtube.com".to_string(), "youtu.be".to_string()];
        assert!(validate_media_url("https://music.youtube.com/watch?v=1", &allowed).is_ok());
        assert!(validate_media_url("https://youtu.be/abc", &allowed).is_ok());
        assert!(validate_media_url("https://notyoutube.com/abc", &allowed).is_err());
    }

    #[test]
    fn file_stem_sanitizer_removes_hostile_characters() {
        assert_eq!(
            sanitize_file_stem("AC/DC: Back in Black?  (Live)").as_deref(),
            Some("ACDC Back in Black (Live)")
        );
        assert_eq!(
            sanitize_file_stem("Песня \"дня\"").as_deref(),
            Some("Песня дня")
        );
        assert_eq!(sanitize_file_stem(" ... "), None);
        assert_eq!(sanitize_file_stem("<>|*"), None);
        let long = "a".repeat(400);
        assert_eq!(sanitize_file_stem(&long).map(|value| value.len()), Some(MAX_TITLE_CHARS));
    }

    #[test]
    fn safe_file_names() {
        assert!(is_safe_file_name("My Song.mp3"));
        assert!(!is_safe_file_name("../etc/passwd"));
        assert!(!is_safe_file_name("a/b.mp3"));
        assert!(!is_safe_file_name(".hidden"));
        assert!(!is_safe_file_name(""));
    }
}

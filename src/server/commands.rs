// HTTP handlers.
use super::*;

const INDEX_HTML: &str = include_str!("../../assets/index.html");

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SubmitRequest {
    #[serde(default)]
    pub(crate) url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubmitResponse {
    pub(crate) download_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CancelResponse {
    pub(crate) download_id: String,
    pub(crate) cancelled: bool,
}

pub(crate) async fn index_page() -> Html<&'static str> {
    Html(INDEX_HTML)
}

fn is_json_request(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start().starts_with("application/json"))
        .unwrap_or(false)
}

pub(crate) async fn submit_download(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Json<SubmitResponse>> {
    let payload = if is_json_request(&request) {
        Json::<SubmitRequest>::from_request(request, &state)
            .await
            .map(|Json(payload)| payload)
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?
    } else {
        Form::<SubmitRequest>::from_request(request, &state)
            .await
            .map(|Form(payload)| payload)
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?
    };

    let download_id = state.jobs.submit(payload.url.as_deref())?;
    Ok(Json(SubmitResponse { download_id }))
}

pub(crate) async fn check_status(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<String>,
) -> ApiResult<Json<JobRecord>> {
    state
        .jobs
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("download not found"))
}

pub(crate) async fn cancel_download(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<String>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    match state.jobs.cancel(&id) {
        CancelOutcome::Requested => Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                download_id: id,
                cancelled: true,
            }),
        )),
        CancelOutcome::AlreadyFinished => Err(ApiError::conflict("download already finished")),
        CancelOutcome::NotFound => Err(ApiError::not_found("download not found")),
    }
}

pub(crate) async fn get_file(
    method: Method,
    State(state): State<AppState>,
    RoutePath(filename): RoutePath<String>,
) -> ApiResult<Response> {
    if !is_safe_file_name(&filename) {
        return Err(ApiError::bad_request("invalid filename"));
    }
    let path = state.jobs.output_dir().join(&filename);
    // HEAD bodies are dropped unsent; the file must survive for the real GET.
    let delete_after = state.jobs.settings().delete_after_download && method != Method::HEAD;
    stream_audio_file(path, delete_after).await
}

pub(crate) async fn tools_report(
    State(state): State<AppState>,
) -> ApiResult<Json<RuntimeToolsStatus>> {
    let jobs = state.jobs.clone();
    tokio::task::spawn_blocking(move || jobs.tools_status())
        .await
        .map(Json)
        .map_err(|error| ApiError::internal(format!("Failed to inspect tools: {error}")))
}

pub(crate) async fn fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

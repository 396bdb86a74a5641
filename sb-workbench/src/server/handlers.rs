use super::*;

use axum::extract::ws::{Message, WebSocket};
use device::{ClientEnvelope, RelayConfig, RelayEvent, RelaySession, ServerEnvelope};

pub(super) async fn access_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let uri = request.uri().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    if path != "/healthz" {
        info!(
            method = %method,
            uri = %uri,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "http access"
        );
    }
    response
}

pub(super) async fn healthz_handler() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub(super) async fn metrics_handler(State(state): State<WorkbenchState>) -> impl IntoResponse {
    let metrics = format!(
        concat!(
            "sb_workbench_uptime_seconds {}\n",
            "sb_workbench_active_relay_sessions {}\n",
            "sb_workbench_sketch_writes_total {}\n",
            "sb_workbench_sketch_deletes_total {}\n",
            "sb_workbench_compile_requests_total {}\n",
            "sb_workbench_compile_failures_total {}\n",
            "sb_workbench_upload_requests_total {}\n",
            "sb_workbench_upload_failures_total {}\n",
            "sb_workbench_relay_sessions_opened_total {}\n",
            "sb_workbench_relay_sessions_denied_total {}\n",
            "sb_workbench_assistant_requests_total {}\n",
            "sb_workbench_assistant_failures_total {}\n"
        ),
        state.metrics.started_at.elapsed().as_secs(),
        state.relay.held_count(),
        state.metrics.sketch_writes_total.load(Ordering::Relaxed),
        state.metrics.sketch_deletes_total.load(Ordering::Relaxed),
        state.metrics.compile_requests_total.load(Ordering::Relaxed),
        state.metrics.compile_failures_total.load(Ordering::Relaxed),
        state.metrics.upload_requests_total.load(Ordering::Relaxed),
        state.metrics.upload_failures_total.load(Ordering::Relaxed),
        state
            .metrics
            .relay_sessions_opened_total
            .load(Ordering::Relaxed),
        state
            .metrics
            .relay_sessions_denied_total
            .load(Ordering::Relaxed),
        state
            .metrics
            .assistant_requests_total
            .load(Ordering::Relaxed),
        state
            .metrics
            .assistant_failures_total
            .load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics,
    )
}

pub(super) async fn ui_index_handler() -> impl IntoResponse {
    ui_asset_response("index.html")
}

pub(super) async fn ui_asset_handler(Path(path): Path<String>) -> impl IntoResponse {
    let normalized = path.trim_start_matches('/');
    if normalized.is_empty() {
        return ui_asset_response("index.html");
    }
    ui_asset_response(normalized)
}

fn ui_asset_response(path: &str) -> Response {
    if let Some(bytes) = embedded_webui::get_asset(path) {
        return (
            StatusCode::OK,
            [(CONTENT_TYPE, webui_content_type(path))],
            bytes.to_vec(),
        )
            .into_response();
    }

    if let Some(index) = embedded_webui::get_asset("index.html") {
        return (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/html; charset=utf-8")],
            index.to_vec(),
        )
            .into_response();
    }

    let message = if embedded_webui::has_assets() {
        "webui asset not found"
    } else {
        "webui assets are not embedded; populate sb-workbench/webui/dist before compiling"
    };
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub(super) async fn list_boards_handler() -> Json<BoardListResponse> {
    Json(BoardListResponse {
        boards: device::BOARD_CATALOG.to_vec(),
    })
}

pub(super) async fn list_ports_handler() -> Json<device::PortScan> {
    Json(device::scan_ports())
}

pub(super) async fn list_sketches_handler(
    State(state): State<WorkbenchState>,
) -> Result<Json<SketchListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let sketches = state.sketches.list().map_err(store_error_response)?;
    Ok(Json(SketchListResponse { sketches }))
}

pub(super) async fn get_sketch_handler(
    State(state): State<WorkbenchState>,
    Path(name): Path<String>,
) -> Result<Json<SketchResponse>, (StatusCode, Json<ErrorResponse>)> {
    let (name, content) = state.sketches.read(&name).map_err(store_error_response)?;
    Ok(Json(SketchResponse { name, content }))
}

pub(super) async fn save_sketch_handler(
    State(state): State<WorkbenchState>,
    Path(name): Path<String>,
    Json(request): Json<SaveSketchRequest>,
) -> Result<Json<SavedSketchResponse>, (StatusCode, Json<ErrorResponse>)> {
    let name = state
        .sketches
        .write(&name, &request.content)
        .await
        .map_err(store_error_response)?;
    state
        .metrics
        .sketch_writes_total
        .fetch_add(1, Ordering::Relaxed);
    Ok(Json(SavedSketchResponse {
        name,
        saved_unix_ms: now_unix_ms(),
    }))
}

pub(super) async fn delete_sketch_handler(
    State(state): State<WorkbenchState>,
    Path(name): Path<String>,
) -> Result<Json<DeletedSketchResponse>, (StatusCode, Json<ErrorResponse>)> {
    let name = state.sketches.delete(&name).await.map_err(store_error_response)?;
    state
        .metrics
        .sketch_deletes_total
        .fetch_add(1, Ordering::Relaxed);
    Ok(Json(DeletedSketchResponse {
        name,
        deleted: true,
    }))
}

pub(super) async fn list_templates_handler(
    State(state): State<WorkbenchState>,
) -> Result<Json<TemplateListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let templates = state.templates.list().map_err(store_error_response)?;
    Ok(Json(TemplateListResponse { templates }))
}

pub(super) async fn get_template_handler(
    State(state): State<WorkbenchState>,
    Path(name): Path<String>,
) -> Result<Json<TemplateResponse>, (StatusCode, Json<ErrorResponse>)> {
    let (name, content) = state.templates.read(&name).map_err(store_error_response)?;
    Ok(Json(TemplateResponse { name, content }))
}

pub(super) async fn compile_handler(
    State(state): State<WorkbenchState>,
    Json(request): Json<CompileRequest>,
) -> Result<Json<ToolResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .metrics
        .compile_requests_total
        .fetch_add(1, Ordering::Relaxed);
    let (name, source) = state
        .sketches
        .read(&request.sketch)
        .map_err(store_error_response)?;
    let outcome = state
        .toolchain
        .compile(&name, &source, &request.board)
        .await
        .map_err(toolchain_error_response)?;
    if !outcome.report.success {
        state
            .metrics
            .compile_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }
    Ok(Json(tool_response(outcome.report, "compile")))
}

pub(super) async fn upload_handler(
    State(state): State<WorkbenchState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<ToolResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .metrics
        .upload_requests_total
        .fetch_add(1, Ordering::Relaxed);

    // An active relay session owns the port exclusively; fail fast instead
    // of letting the toolchain fight over the device.
    if state.relay.is_held(&request.port) {
        state
            .metrics
            .upload_failures_total
            .fetch_add(1, Ordering::Relaxed);
        return Err(conflict(&format!(
            "port {} is held by an active serial session; close it before uploading",
            request.port
        )));
    }

    let (name, source) = state
        .sketches
        .read(&request.sketch)
        .map_err(store_error_response)?;
    let outcome = state
        .toolchain
        .compile(&name, &source, &request.board)
        .await
        .map_err(toolchain_error_response)?;
    if !outcome.report.success {
        state
            .metrics
            .upload_failures_total
            .fetch_add(1, Ordering::Relaxed);
        return Ok(Json(tool_response(outcome.report, "compile")));
    }

    let report = state
        .toolchain
        .upload(&outcome.build_dir, &request.board, &request.port)
        .await
        .map_err(toolchain_error_response)?;
    if !report.success {
        state
            .metrics
            .upload_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }
    Ok(Json(tool_response(report, "upload")))
}

pub(super) async fn assistant_generate_handler(
    State(state): State<WorkbenchState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, (StatusCode, Json<ErrorResponse>)> {
    if request.prompt.trim().is_empty() {
        return Err(bad_request("prompt cannot be empty"));
    }
    state
        .metrics
        .assistant_requests_total
        .fetch_add(1, Ordering::Relaxed);
    let code = state.assistant.generate(&request.prompt).await.map_err(|err| {
        state
            .metrics
            .assistant_failures_total
            .fetch_add(1, Ordering::Relaxed);
        assistant_error_response(err)
    })?;
    Ok(Json(GenerateResponse {
        code,
        model: state.assistant.model().to_string(),
    }))
}

pub(super) async fn assistant_review_handler(
    State(state): State<WorkbenchState>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<ReviewResponse>, (StatusCode, Json<ErrorResponse>)> {
    if request.code.trim().is_empty() {
        return Err(bad_request("code cannot be empty"));
    }
    state
        .metrics
        .assistant_requests_total
        .fetch_add(1, Ordering::Relaxed);
    let review = state.assistant.review(&request.code).await.map_err(|err| {
        state
            .metrics
            .assistant_failures_total
            .fetch_add(1, Ordering::Relaxed);
        assistant_error_response(err)
    })?;
    Ok(Json(ReviewResponse {
        review,
        model: state.assistant.model().to_string(),
    }))
}

pub(super) async fn assistant_models_handler(
    State(state): State<WorkbenchState>,
) -> Result<Json<ModelListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let models = state
        .assistant
        .models()
        .await
        .map_err(assistant_error_response)?;
    Ok(Json(ModelListResponse { models }))
}

// The session is opened before the upgrade completes so conflicts and
// missing devices surface as plain HTTP errors instead of an immediately
// closed socket.
pub(super) async fn serial_ws_handler(
    State(state): State<WorkbenchState>,
    Query(query): Query<SerialQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let config = RelayConfig {
        port: query.port,
        baud: query.baud.unwrap_or(device::DEFAULT_BAUD),
    };
    match RelaySession::open(&state.relay, config).await {
        Ok(session) => {
            state
                .metrics
                .relay_sessions_opened_total
                .fetch_add(1, Ordering::Relaxed);
            ws.on_upgrade(move |socket| run_serial_socket(socket, session))
        }
        Err(err) => {
            state
                .metrics
                .relay_sessions_denied_total
                .fetch_add(1, Ordering::Relaxed);
            warn!("serial session rejected: {err}");
            relay_error_response(&err).into_response()
        }
    }
}

async fn run_serial_socket(mut socket: WebSocket, mut session: RelaySession) {
    let opened = ServerEnvelope::Opened {
        session_id: session.session_id().to_string(),
        port: session.port_name().to_string(),
        baud: session.baud(),
    };
    if send_envelope(&mut socket, &opened).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEnvelope>(text.as_str()) {
                            Ok(ClientEnvelope::Send { data }) => {
                                let mut bytes = data.into_bytes();
                                bytes.push(b'\n');
                                if session.write(bytes).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientEnvelope::SetBaud { baud }) => match session.set_baud(baud).await {
                                Ok(()) => {
                                    if send_envelope(&mut socket, &ServerEnvelope::Baud { baud })
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    let _ = send_envelope(
                                        &mut socket,
                                        &ServerEnvelope::Error {
                                            message: err.to_string(),
                                        },
                                    )
                                    .await;
                                    break;
                                }
                            },
                            Err(err) => {
                                if send_envelope(
                                    &mut socket,
                                    &ServerEnvelope::Error {
                                        message: format!("invalid envelope: {err}"),
                                    },
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    // Binary frames pass through to the port verbatim.
                    Some(Ok(Message::Binary(bytes))) => {
                        if session.write(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            event = session.next_event() => {
                match event {
                    Some(RelayEvent::Data(bytes)) => {
                        if socket.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(RelayEvent::Fault(message)) => {
                        let _ = send_envelope(&mut socket, &ServerEnvelope::Error { message }).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let closed = ServerEnvelope::Closed {
        dropped_chunks: session.dropped_chunks(),
    };
    let _ = send_envelope(&mut socket, &closed).await;
    let _ = socket.send(Message::Close(None)).await;
    // Dropping the session stops both pumps and releases the port claim.
}

async fn send_envelope(socket: &mut WebSocket, envelope: &ServerEnvelope) -> Result<(), axum::Error> {
    let encoded = match serde_json::to_string(envelope) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!("failed to encode relay envelope: {err}");
            return Ok(());
        }
    };
    socket.send(Message::Text(encoded.into())).await
}

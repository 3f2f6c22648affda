use crate::{
    auth, events,
    events::NewEvent,
    files, messages, users,
    config::Config,
    model::{ChatMessage, Coordinates, RsvpStatus, User},
    validators,
};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, net::SocketAddr, path::PathBuf};
use time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<SqliteConnectionManager>,
    pub media_dir: PathBuf,
    pub jwt_secret: Vec<u8>,
    pub chat_tx: broadcast::Sender<String>,
    pub config: Config,
    pub login_limiter: auth::LoginRateLimiter,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let media_dir = config.data_dir.join("media");
        tokio::fs::create_dir_all(&media_dir).await?;
        let db_path = config.data_dir.join("party.db");
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch(crate::db::SCHEMA));
        let pool = Pool::new(manager)?;
        let jwt_secret = auth::jwt_secret(&*pool.get()?)?;
        let (tx, _rx) = broadcast::channel(100);
        Ok(Self {
            pool,
            media_dir,
            jwt_secret,
            chat_tx: tx,
            config,
            login_limiter: auth::LoginRateLimiter::new(5, std::time::Duration::from_secs(60)),
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, ApiError> {
        self.pool.get().map_err(|e| {
            tracing::error!(error = %e, "database pool exhausted");
            err(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/api/me/avatar", post(upload_avatar))
        .route("/api/events/:id/image", post(upload_event_image))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes() as usize));
    let protected = Router::new()
        .route("/api/me", get(me).patch(update_me))
        .route("/api/users", get(batch_users))
        .route("/api/events", post(create_event).get(list_all_events))
        .route("/api/events/mine", get(list_my_events))
        .route("/api/events/:id", get(get_event).delete(delete_event))
        .route("/api/events/:id/rsvp", put(set_rsvp).delete(leave_event))
        .route(
            "/api/events/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/media/:id", get(download_media))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/verify", post(verify_email))
        .route("/api/auth/login", post(login))
        .route("/api/auth/reset", post(request_reset))
        .route("/api/auth/reset/confirm", post(confirm_reset))
        .merge(uploads)
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if let Ok(claims) = auth::verify_jwt(&state.jwt_secret, token) {
                    req.extensions_mut().insert(claims);
                    return Ok(next.run(req).await);
                }
            }
        }
    }
    Err(StatusCode::UNAUTHORIZED)
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);

fn err(status: StatusCode, msg: &str) -> ApiError {
    (status, Json(ErrorResp { error: msg.into() }))
}

/// Map short store-layer error codes onto HTTP statuses. Anything
/// unrecognized is logged and reported as a bare internal error.
fn store_err(e: anyhow::Error) -> ApiError {
    let code = e.to_string();
    let status = match code.as_str() {
        "not_found" => StatusCode::NOT_FOUND,
        "forbidden" | "not_attending" => StatusCode::FORBIDDEN,
        "email_in_use" | "event_full" => StatusCode::CONFLICT,
        "empty_message" | "empty_title" | "invalid_token" | "bad_subject" => {
            StatusCode::BAD_REQUEST
        }
        _ => {
            tracing::error!(error = %e, "store operation failed");
            return err(StatusCode::INTERNAL_SERVER_ERROR, "internal");
        }
    };
    err(status, &code)
}

fn current_user(conn: &Connection, claims: &auth::Claims) -> Result<User, ApiError> {
    let id = claims.user_id().map_err(store_err)?;
    if let Some(user) = users::get_user(conn, &id).map_err(store_err)? {
        return Ok(user);
    }
    let account = auth::get_account(conn, &id)
        .map_err(store_err)?
        .ok_or_else(|| err(StatusCode::UNAUTHORIZED, "unknown_account"))?;
    users::fetch_or_create(conn, &account).map_err(store_err)
}

// ---- auth ----

#[derive(Deserialize)]
struct SignupReq {
    email: String,
    password: String,
    confirm_password: String,
}

#[derive(Serialize)]
struct SignupResp {
    verification_sent: bool,
}

async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupReq>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(code) = validators::sign_up_error(&req.email, &req.password, &req.confirm_password)
    {
        return Err(err(StatusCode::BAD_REQUEST, code));
    }
    let conn = state.conn()?;
    let account = auth::create_account(&conn, &req.email, &req.password).map_err(store_err)?;
    let token = auth::issue_token(&conn, &account.id, auth::TokenKind::Verify, Duration::hours(24))
        .map_err(store_err)?;
    // no mailer; delivery is the operator's problem
    tracing::info!(email = %account.email, token, "verification email queued");
    Ok((
        StatusCode::CREATED,
        Json(SignupResp {
            verification_sent: true,
        }),
    ))
}

#[derive(Deserialize)]
struct VerifyReq {
    token: String,
}

async fn verify_email(
    State(state): State<AppState>,
    Json(req): Json<VerifyReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let account_id =
        auth::consume_token(&conn, &req.token, auth::TokenKind::Verify).map_err(store_err)?;
    auth::mark_verified(&conn, &account_id).map_err(store_err)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct LoginReq {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResp {
    token: String,
    user: User,
    next_step: users::OnboardingStep,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.login_limiter.check(&req.email) {
        return Err(err(StatusCode::TOO_MANY_REQUESTS, "rate_limited"));
    }
    if !validators::is_login_valid(&req.email, &req.password) {
        return Err(err(StatusCode::UNAUTHORIZED, "invalid_credentials"));
    }
    let conn = state.conn()?;
    let Some((account, hash)) = auth::find_by_email(&conn, &req.email).map_err(store_err)? else {
        return Err(err(StatusCode::UNAUTHORIZED, "invalid_credentials"));
    };
    if !auth::verify_password(&req.password, &hash) {
        return Err(err(StatusCode::UNAUTHORIZED, "invalid_credentials"));
    }
    if !account.verified {
        return Err(err(StatusCode::FORBIDDEN, "email_not_verified"));
    }
    let user = users::fetch_or_create(&conn, &account).map_err(store_err)?;
    let token = auth::issue_jwt(&state.jwt_secret, &account.id.to_string(), Duration::hours(24))
        .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "token"))?;
    let next_step = users::onboarding_step(&user);
    Ok(Json(LoginResp {
        token,
        user,
        next_step,
    }))
}

#[derive(Deserialize)]
struct ResetReq {
    email: String,
}

async fn request_reset(
    State(state): State<AppState>,
    Json(req): Json<ResetReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    // always 200 so callers cannot probe which emails exist
    if let Some((account, _)) = auth::find_by_email(&conn, &req.email).map_err(store_err)? {
        let token =
            auth::issue_token(&conn, &account.id, auth::TokenKind::Reset, Duration::hours(1))
                .map_err(store_err)?;
        tracing::info!(email = %account.email, token, "password reset email queued");
    }
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct ResetConfirmReq {
    token: String,
    new_password: String,
}

async fn confirm_reset(
    State(state): State<AppState>,
    Json(req): Json<ResetConfirmReq>,
) -> Result<impl IntoResponse, ApiError> {
    if req.new_password.len() < 8 {
        return Err(err(StatusCode::BAD_REQUEST, "weak_password"));
    }
    let conn = state.conn()?;
    let account_id =
        auth::consume_token(&conn, &req.token, auth::TokenKind::Reset).map_err(store_err)?;
    auth::set_password(&conn, &account_id, &req.new_password).map_err(store_err)?;
    Ok(StatusCode::OK)
}

// ---- profile ----

async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
) -> Result<Json<User>, ApiError> {
    let conn = state.conn()?;
    Ok(Json(current_user(&conn, &claims)?))
}

#[derive(Deserialize)]
struct UpdateMeReq {
    name: Option<String>,
    birth_date: Option<i64>,
    bio: Option<String>,
}

async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Json(req): Json<UpdateMeReq>,
) -> Result<Json<User>, ApiError> {
    if let Some(name) = &req.name {
        if !validators::is_profile_name_valid(name) {
            return Err(err(StatusCode::BAD_REQUEST, "invalid_name"));
        }
    }
    let conn = state.conn()?;
    let user = current_user(&conn, &claims)?;
    users::update_profile(
        &conn,
        &user.id,
        req.name.as_deref().map(str::trim),
        req.birth_date,
        req.bio.as_deref(),
    )
    .map_err(store_err)?;
    let user = users::get_user(&conn, &user.id)
        .map_err(store_err)?
        .ok_or_else(|| err(StatusCode::INTERNAL_SERVER_ERROR, "internal"))?;
    Ok(Json(user))
}

#[derive(Serialize)]
struct MediaResp {
    url: String,
}

async fn read_image_field(multipart: &mut Multipart) -> Result<bytes::Bytes, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?
        .ok_or_else(|| err(StatusCode::BAD_REQUEST, "missing_file"))?;
    let data = field
        .bytes()
        .await
        .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?;
    // trust the bytes, not the declared content type
    match image::guess_format(&data) {
        Ok(image::ImageFormat::Jpeg) | Ok(image::ImageFormat::Png) => Ok(data),
        _ => Err(err(StatusCode::BAD_REQUEST, "unsupported_image")),
    }
}

async fn upload_avatar(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let data = read_image_field(&mut multipart).await?;
    let conn = state.conn()?;
    let user = current_user(&conn, &claims)?;
    let id = files::save_object(&state.media_dir, data)
        .await
        .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "storage"))?;
    let url = files::media_url(&id);
    if let Some(old) = user
        .profile_image_url
        .as_deref()
        .and_then(files::id_from_media_url)
    {
        if old != id {
            let _ = files::delete_object(&state.media_dir, old).await;
        }
    }
    users::update_profile_image(&conn, &user.id, &url).map_err(store_err)?;
    Ok(Json(MediaResp { url }))
}

#[derive(Deserialize)]
struct IdsQuery {
    ids: Option<String>,
}

async fn batch_users(
    State(state): State<AppState>,
    Query(query): Query<IdsQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let ids = query.ids.unwrap_or_default();
    let mut parsed = Vec::new();
    for id in ids.split(',').filter(|s| !s.is_empty()) {
        let id = Uuid::parse_str(id).map_err(|_| err(StatusCode::BAD_REQUEST, "invalid_id"))?;
        parsed.push(id);
    }
    let conn = state.conn()?;
    Ok(Json(users::get_users(&conn, &parsed).map_err(store_err)?))
}

// ---- events ----

#[derive(Deserialize)]
struct CreateEventReq {
    title: String,
    event_date: i64,
    location_name: String,
    coordinates: Option<Coordinates>,
    description: Option<String>,
    tags: Option<Vec<String>>,
    participant_limit: Option<u32>,
}

async fn create_event(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Json(req): Json<CreateEventReq>,
) -> Result<impl IntoResponse, ApiError> {
    let creator = claims.user_id().map_err(store_err)?;
    let mut conn = state.conn()?;
    let event = events::create_event(
        &mut conn,
        &creator,
        NewEvent {
            title: req.title,
            event_date: req.event_date,
            location_name: req.location_name,
            coordinates: req.coordinates,
            description: req.description,
            tags: req.tags,
            participant_limit: req.participant_limit,
        },
    )
    .map_err(store_err)?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn list_all_events(
    State(state): State<AppState>,
) -> Result<Json<Vec<events::Event>>, ApiError> {
    let conn = state.conn()?;
    Ok(Json(events::list_all_events(&conn).map_err(store_err)?))
}

async fn list_my_events(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
) -> Result<Json<Vec<events::Event>>, ApiError> {
    let user_id = claims.user_id().map_err(store_err)?;
    let conn = state.conn()?;
    Ok(Json(
        events::list_events_for_user(&conn, &user_id).map_err(store_err)?,
    ))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<events::Event>, ApiError> {
    let conn = state.conn()?;
    let event = events::get_event(&conn, &id)
        .map_err(store_err)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "not_found"))?;
    Ok(Json(event))
}

#[derive(Deserialize)]
struct RsvpReq {
    status: RsvpStatus,
}

async fn set_rsvp(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<RsvpReq>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.user_id().map_err(store_err)?;
    let conn = state.conn()?;
    events::set_rsvp(&conn, &id, &user_id, req.status).map_err(store_err)?;
    Ok(StatusCode::OK)
}

async fn leave_event(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.user_id().map_err(store_err)?;
    let conn = state.conn()?;
    events::remove_rsvp(&conn, &id, &user_id).map_err(store_err)?;
    Ok(StatusCode::OK)
}

async fn upload_event_image(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let data = read_image_field(&mut multipart).await?;
    let user_id = claims.user_id().map_err(store_err)?;
    let conn = state.conn()?;
    let event = events::get_event(&conn, &id)
        .map_err(store_err)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "not_found"))?;
    if event.creator_id != user_id {
        return Err(err(StatusCode::FORBIDDEN, "forbidden"));
    }
    let object_id = files::save_object(&state.media_dir, data)
        .await
        .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "storage"))?;
    let url = files::media_url(&object_id);
    if let Some(old) = event
        .image_url
        .as_deref()
        .and_then(files::id_from_media_url)
    {
        if old != object_id {
            let _ = files::delete_object(&state.media_dir, old).await;
        }
    }
    events::set_event_image(&conn, &id, &url).map_err(store_err)?;
    Ok(Json(MediaResp { url }))
}

async fn delete_event(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.user_id().map_err(store_err)?;
    let conn = state.conn()?;
    let image_url = events::delete_event(&conn, &id, &user_id).map_err(store_err)?;
    if let Some(object_id) = image_url.as_deref().and_then(files::id_from_media_url) {
        let _ = files::delete_object(&state.media_dir, object_id).await;
    }
    Ok(StatusCode::OK)
}

// ---- chat ----

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let conn = state.conn()?;
    if events::get_event(&conn, &id).map_err(store_err)?.is_none() {
        return Err(err(StatusCode::NOT_FOUND, "not_found"));
    }
    Ok(Json(messages::list_messages(&conn, &id).map_err(store_err)?))
}

#[derive(Deserialize)]
struct SendMessageReq {
    text: String,
}

/// Frame broadcast to live chat subscribers.
#[derive(Serialize)]
struct ChatFrame {
    t: &'static str,
    event_id: Uuid,
    message: ChatMessage,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    if events::get_event(&conn, &id).map_err(store_err)?.is_none() {
        return Err(err(StatusCode::NOT_FOUND, "not_found"));
    }
    let sender = current_user(&conn, &claims)?;
    let message = messages::send_message(&conn, &id, &sender, &req.text).map_err(store_err)?;
    if let Ok(frame) = serde_json::to_string(&ChatFrame {
        t: "message",
        event_id: id,
        message: message.clone(),
    }) {
        let _ = state.chat_tx.send(frame);
    }
    Ok((StatusCode::CREATED, Json(message)))
}

// ---- media ----

async fn download_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let path = files::object_path(&state.media_dir, &id).ok_or(StatusCode::NOT_FOUND)?;
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let mut head = [0u8; 16];
    let n = file.read(&mut head).await.map_err(|_| StatusCode::NOT_FOUND)?;
    let mime = match image::guess_format(&head[..n]) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        _ => "application/octet-stream",
    };
    file.rewind()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let stream = ReaderStream::new(file);
    let body = StreamBody::new(stream);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(mime),
    );
    Ok((headers, body))
}

// ---- websocket ----

#[derive(Deserialize)]
struct WsAction {
    action: String,
    event_id: Uuid,
}

#[derive(Serialize)]
struct SnapshotFrame {
    t: &'static str,
    event_id: Uuid,
    messages: Vec<ChatMessage>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state)))
}

/// One subscription per screen: the client joins the events it is viewing
/// and only frames for those events are forwarded. Everything ends when the
/// socket closes; there is no buffering or replay beyond the join snapshot.
async fn handle_socket(stream: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = stream.split();
    let mut rx = BroadcastStream::new(state.chat_tx.subscribe());
    let mut joined: HashSet<Uuid> = HashSet::new();
    let _ = sender.send(Message::Text("hello".into())).await;
    loop {
        tokio::select! {
            frame = rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(_)) => continue,
                    None => break,
                };
                let event_id = serde_json::from_str::<serde_json::Value>(&frame)
                    .ok()
                    .and_then(|v| v["event_id"].as_str().and_then(|s| Uuid::parse_str(s).ok()));
                if let Some(event_id) = event_id {
                    if joined.contains(&event_id)
                        && sender.send(Message::Text(frame)).await.is_err()
                    {
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(action) = serde_json::from_str::<WsAction>(&text) else {
                            continue;
                        };
                        if action.action == "join" && join_event(&state, action.event_id, &mut sender).await {
                            joined.insert(action.event_id);
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Send the join snapshot. Returns false when the event is unknown or the
/// socket has gone away.
async fn join_event(
    state: &AppState,
    event_id: Uuid,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
) -> bool {
    let Ok(conn) = state.pool.get() else {
        return false;
    };
    match events::get_event(&conn, &event_id) {
        Ok(Some(_)) => {}
        _ => return false,
    }
    let Ok(messages) = messages::list_messages(&conn, &event_id) else {
        return false;
    };
    let frame = SnapshotFrame {
        t: "snapshot",
        event_id,
        messages,
    };
    match serde_json::to_string(&frame) {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}

/// Run the HTTP server bound to the provided address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let state = AppState::new(config).await?;
    crate::housekeeping::run_housekeeping(state.clone());
    let addr: SocketAddr = state.config.bind.parse()?;
    tracing::info!(%addr, "party server listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

use log::warn;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::{Direction, parse_level};
use crate::error::GpioError;
use crate::gpio::{GpioManager, ValueChangedEvent};
use crate::pin::PinSettings;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<GpioManager>,
}

#[derive(Deserialize)]
struct SettingsPayload {
    direction: Option<Direction>,
    active_low: Option<bool>,
    raise_events: Option<bool>,
}

#[derive(Deserialize, Default)]
struct PulsePayload {
    assert_ms: Option<u64>,
    deassert_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct WaitQuery {
    value: String,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct ChangeQuery {
    timeout_ms: Option<u64>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<ValueChangedEvent>,
    pin_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if pin_filter.is_none_or(|p| p == event.pin_id)
                            && let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = GpioError::Io(format!("Event stream lagged by {n} messages"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn resource(path: &str, allowed: &[Method]) -> actix_web::Resource {
    web::resource(path).route(
        web::route()
            .guard(guard_not_methods(allowed))
            .to(method_not_allowed),
    )
}

impl AppState {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        let get = &[Method::GET];
        let post = &[Method::POST];
        let get_post = &[Method::GET, Method::POST];

        web::scope(base_path)
            .service(resource("/pins", get).route(web::get().to(list_pins)))
            .service(resource("/pins/events", get).route(web::get().to(events_ws_all)))
            .service(resource("/pin/{pin_id}", get).route(web::get().to(pin_descriptor)))
            .service(resource("/pin/{pin_id}/open", post).route(web::post().to(open_pin)))
            .service(resource("/pin/{pin_id}/close", post).route(web::post().to(close_pin)))
            .service(
                resource("/pin/{pin_id}/settings", get_post)
                    .route(web::get().to(get_settings))
                    .route(web::post().to(set_settings)),
            )
            .service(
                resource("/pin/{pin_id}/value", get_post)
                    .route(web::get().to(get_value))
                    .route(web::post().to(set_value)),
            )
            .service(resource("/pin/{pin_id}/pulse", post).route(web::post().to(pulse)))
            .service(resource("/pin/{pin_id}/wait", get).route(web::get().to(wait_for_value)))
            .service(resource("/pin/{pin_id}/change", get).route(web::get().to(wait_for_change)))
            .service(resource("/pin/{pin_id}/event", get).route(web::get().to(get_last_event)))
            .service(resource("/pin/{pin_id}/events", get).route(web::get().to(get_events)))
            .service(resource("/pin/{pin_id}/events/ws", get).route(web::get().to(events_ws_pin)))
    }
}

async fn list_pins(state: web::Data<AppState>) -> Result<impl Responder, GpioError> {
    let pins = state.manager.list_pins().await;

    Ok(web::Json(pins))
}

async fn pin_descriptor(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let desc = state.manager.get_pin_descriptor(pin_id).await?;

    Ok(web::Json(desc))
}

async fn open_pin(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    state.manager.open_pin(pin_id).await?;

    Ok(HttpResponse::Ok())
}

async fn close_pin(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    state.manager.close_pin(pin_id).await?;

    Ok(HttpResponse::Ok())
}

async fn get_settings(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let settings = state.manager.get_pin_settings(pin_id).await?;

    Ok(web::Json(settings))
}

async fn set_settings(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let current = state.manager.get_pin_settings(pin_id).await?;
    let merged = parse_settings_payload(&body, current)?;

    state.manager.set_pin_settings(pin_id, &merged).await?;

    Ok(web::Json(merged))
}

async fn get_value(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;

    let value = state.manager.read_value(pin_id).await?;

    Ok(web::Json(u8::from(value)))
}

async fn set_value(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let value = parse_value_payload(&body)?;

    state.manager.write_value(pin_id, value).await?;

    Ok(HttpResponse::Ok())
}

async fn pulse(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let payload: PulsePayload = if body.is_empty() {
        PulsePayload::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GpioError::InvalidValue(format!("Invalid pulse payload: {e}")))?
    };

    state
        .manager
        .pulse(
            pin_id,
            payload.assert_ms.map(Duration::from_millis),
            payload.deassert_ms.map(Duration::from_millis),
        )
        .await?;

    Ok(HttpResponse::Ok())
}

async fn wait_for_value(
    req: HttpRequest,
    query: web::Query<WaitQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let target = parse_level(&query.value)?;

    state
        .manager
        .wait_for_value(pin_id, target, query.timeout_ms.map(Duration::from_millis))
        .await?;

    Ok(web::Json(u8::from(target)))
}

async fn wait_for_change(
    req: HttpRequest,
    query: web::Query<ChangeQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;

    let value = state
        .manager
        .wait_for_change(pin_id, query.timeout_ms.map(Duration::from_millis))
        .await?;

    Ok(web::Json(u8::from(value)))
}

async fn get_last_event(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;

    let last = state.manager.get_last_event(pin_id).await?;

    match last {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;

    let events = state.manager.get_events(pin_id, query.limit).await?;

    Ok(web::Json(events))
}

async fn events_ws_all(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GpioError> {
    open_event_socket(&req, stream, &state, None)
}

async fn events_ws_pin(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    state.manager.pin(pin_id)?;

    open_event_socket(&req, stream, &state, Some(pin_id))
}

fn open_event_socket(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState,
    pin_filter: Option<u32>,
) -> Result<HttpResponse, GpioError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| GpioError::InvalidValue(format!("Websocket handshake failed: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, pin_filter).await;
    });

    Ok(response)
}

fn parse_value_payload(body: &[u8]) -> Result<bool, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => parse_level(text.trim()),
        _ => Err(GpioError::InvalidValue(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_pin_id(req: &HttpRequest) -> Result<u32, GpioError> {
    let pin_id = req
        .match_info()
        .get("pin_id")
        .ok_or_else(|| GpioError::InvalidValue("Missing pin id".into()))?;
    let pin_id = pin_id
        .parse::<u32>()
        .map_err(|_| GpioError::InvalidValue("Invalid pin id".into()))?;

    Ok(pin_id)
}

fn parse_settings_payload(body: &[u8], current: PinSettings) -> Result<PinSettings, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty settings payload".into()));
    }

    let payload: SettingsPayload = serde_json::from_slice(body)
        .map_err(|e| GpioError::InvalidValue(format!("Invalid settings payload: {e}")))?;

    let mut merged = current;
    if let Some(direction) = payload.direction {
        merged.direction = direction;
    }
    if let Some(active_low) = payload.active_low {
        merged.active_low = active_low;
    }
    if let Some(raise_events) = payload.raise_events {
        merged.raise_events = raise_events;
    }
    Ok(merged)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}

use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{broadcast::error::RecvError, mpsc},
};
use tracing::{error, info, warn};

use climate_common::{
    read_until_valid, Actuator, ClimateMode, ControlError, MqttConfig, OutboundMessage,
    RetryPolicy, RoomChange, RoomController, RoomState, RuntimeConfig, ShadowError,
    ShadowGateway, ShadowTopics, TemperatureSensor,
};

use crate::{
    gpio::{LoggingActuator, SysfsGpio},
    w1::{SimulatedSensors, W1Sensors},
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 8 * 1024;

#[derive(Clone)]
struct AppState {
    gateway: ShadowGateway,
    events: mpsc::UnboundedSender<ShadowEvent>,
}

impl AppState {
    /// Queues a reported-state publish behind every event already queued.
    fn request_report(&self, include_temp: bool) {
        if self.events.send(ShadowEvent::Report { include_temp }).is_err() {
            warn!("shadow event loop stopped, report dropped");
        }
    }
}

/// Everything that ends in a publish to the shadow. A single task consumes
/// these, so reports leave in the order their snapshots were taken.
#[derive(Debug)]
enum ShadowEvent {
    Connected,
    Publish { topic: String, payload: Vec<u8> },
    Report { include_temp: bool },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct RoomView {
    room: String,
    mode: &'static str,
    time: u32,
    temp: Option<f32>,
    #[serde(rename = "timerArmed")]
    timer_armed: bool,
}

#[derive(Debug, Deserialize)]
struct ModeQuery {
    value: String,
    #[serde(default)]
    minutes: u32,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();
    runtime.validate().context("invalid runtime config")?;

    let mut gpio = None;
    let (actuator, sensor): (Arc<dyn Actuator>, Arc<dyn TemperatureSensor>) =
        if runtime.gpio.dry_run {
            info!("dry run: relays and probes are simulated");
            (
                Arc::new(LoggingActuator),
                Arc::new(SimulatedSensors::new(&runtime.rooms)),
            )
        } else {
            let sysfs = Arc::new(SysfsGpio::open(&runtime.gpio, &runtime.rooms)?);
            gpio = Some(Arc::clone(&sysfs));
            (
                sysfs,
                Arc::new(W1Sensors::discover(&runtime.sensor, &runtime.rooms)),
            )
        };

    let controller = RoomController::new(runtime.room_keys(), actuator)
        .context("failed to drive outputs to their initial state")?;
    let retry = RetryPolicy::from(&runtime.sensor);
    refresh_temperatures(&controller, sensor.as_ref(), retry).await;

    let gateway = ShadowGateway::new(
        controller.clone(),
        ShadowTopics::for_thing(&runtime.mqtt.thing_name),
    );
    let mqtt_options = build_mqtt_options(&runtime.mqtt).await?;
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let app_state = AppState {
        gateway,
        events: events_tx.clone(),
    };

    spawn_mqtt_loop(eventloop, events_tx);
    spawn_dispatch_loop(app_state.gateway.clone(), mqtt.clone(), events_rx);
    spawn_expiry_publisher(app_state.clone());
    if let Some(secs) = runtime.sensor.refresh_interval_secs {
        spawn_temperature_refresh(app_state.clone(), sensor, retry, Duration::from_secs(secs));
    }

    let app = Router::new()
        .route("/api/rooms", get(handle_get_rooms))
        .route("/api/rooms/{room}", get(handle_get_room))
        .route("/api/rooms/{room}/mode", post(handle_set_mode))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, switching every room off");
    controller.shutdown().await;
    if let Some(gpio) = gpio {
        gpio.release();
    }
    if let Err(err) = mqtt.disconnect().await {
        warn!("mqtt disconnect failed: {err}");
    }
    Ok(())
}

async fn build_mqtt_options(config: &MqttConfig) -> anyhow::Result<MqttOptions> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);

    if let Some(tls) = &config.tls {
        let ca = read_pem(&tls.root_ca, "root CA").await?;
        let certificate = read_pem(&tls.certificate, "client certificate").await?;
        let private_key = read_pem(&tls.private_key, "private key").await?;
        options.set_transport(Transport::tls(ca, Some((certificate, private_key)), None));
    } else {
        warn!("no tls configured, connecting to {} in plain text", config.host);
    }

    Ok(options)
}

async fn read_pem(path: &std::path::Path, what: &str) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {what} from {}", path.display()))
}

fn spawn_mqtt_loop(mut eventloop: EventLoop, events: mpsc::UnboundedSender<ShadowEvent>) {
    tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    ShadowEvent::Publish {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    ShadowEvent::Connected
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            if events.send(event).is_err() {
                break;
            }
        }
    });
}

/// Handles shadow events one at a time, in arrival order.
fn spawn_dispatch_loop(
    gateway: ShadowGateway,
    mqtt: AsyncClient,
    mut events: mpsc::UnboundedReceiver<ShadowEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if matches!(event, ShadowEvent::Connected) {
                if let Err(err) = subscribe_shadow(&mqtt, gateway.topics()).await {
                    warn!("shadow subscribe after connect failed: {err:#}");
                }
            }
            match outbound_for(&gateway, event).await {
                Ok(Some(message)) => publish(&mqtt, message).await,
                Ok(None) => {}
                Err(err) => warn!("shadow event handling failed: {err}"),
            }
        }
    });
}

async fn subscribe_shadow(mqtt: &AsyncClient, topics: &ShadowTopics) -> anyhow::Result<()> {
    for topic in [&topics.delta, &topics.rejected] {
        mqtt.subscribe(topic.as_str(), QoS::AtMostOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    Ok(())
}

/// The publish an event calls for. Snapshots are taken here, at handling
/// time, never by the code that raised the event.
async fn outbound_for(
    gateway: &ShadowGateway,
    event: ShadowEvent,
) -> Result<Option<OutboundMessage>, ShadowError> {
    match event {
        ShadowEvent::Connected | ShadowEvent::Report { include_temp: true } => {
            gateway.encode(&gateway.full_report().await).map(Some)
        }
        ShadowEvent::Report {
            include_temp: false,
        } => gateway.encode(&gateway.mode_report().await).map(Some),
        ShadowEvent::Publish { topic, payload } => gateway.dispatch(&topic, &payload).await,
    }
}

fn spawn_expiry_publisher(app_state: AppState) {
    let mut changes = app_state.gateway.controller().subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(RoomChange::Expired { room }) => {
                    info!(room = room.as_str(), "reporting state after auto-shutoff");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "room change stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
            app_state.request_report(false);
        }
    });
}

fn spawn_temperature_refresh(
    app_state: AppState,
    sensor: Arc<dyn TemperatureSensor>,
    retry: RetryPolicy,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately and startup already read once.
        interval.tick().await;
        loop {
            interval.tick().await;
            refresh_temperatures(app_state.gateway.controller(), sensor.as_ref(), retry).await;
            app_state.request_report(true);
        }
    });
}

async fn refresh_temperatures(
    controller: &RoomController,
    sensor: &dyn TemperatureSensor,
    retry: RetryPolicy,
) {
    let rooms: Vec<String> = controller.rooms().map(str::to_string).collect();
    for room in rooms {
        match read_until_valid(sensor, &room, retry).await {
            Ok(celsius) => {
                info!(room = room.as_str(), celsius, "temperature read");
                if let Err(err) = controller.record_temperature(&room, celsius).await {
                    warn!("failed to record temperature: {err}");
                }
            }
            Err(err) => warn!(room = room.as_str(), "temperature unavailable: {err}"),
        }
    }
}

async fn publish(mqtt: &AsyncClient, message: OutboundMessage) {
    if let Err(err) = mqtt
        .publish(message.topic, QoS::AtMostOnce, false, message.payload)
        .await
    {
        warn!("reported state publish failed: {err}");
    }
}

async fn handle_get_rooms(State(state): State<AppState>) -> impl IntoResponse {
    let controller = state.gateway.controller();
    let rooms: Vec<RoomView> = controller
        .snapshot()
        .await
        .into_iter()
        .map(|(room, room_state)| build_room_view(controller, room, &room_state))
        .collect();
    Json(rooms)
}

async fn handle_get_room(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> impl IntoResponse {
    let controller = state.gateway.controller();
    match controller.current_state(&room).await {
        Some(room_state) => Json(build_room_view(controller, room, &room_state)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown room"),
    }
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(params): Query<ModeQuery>,
) -> impl IntoResponse {
    let Some(mode) = ClimateMode::parse(&params.value.to_ascii_uppercase()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use 'OFF', 'HEAT' or 'COOL'",
        );
    };

    let controller = state.gateway.controller();
    match controller.set_mode(&room, mode, params.minutes).await {
        Ok(room_state) => {
            state.request_report(false);
            Json(build_room_view(controller, room, &room_state)).into_response()
        }
        Err(ControlError::UnknownRoom(_)) => error_response(StatusCode::NOT_FOUND, "Unknown room"),
        Err(err) => {
            error!("manual mode change failed: {err}");
            state.request_report(false);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to drive outputs")
        }
    }
}

fn build_room_view(controller: &RoomController, room: String, state: &RoomState) -> RoomView {
    RoomView {
        timer_armed: controller.has_pending_timer(&room),
        room,
        mode: state.mode.as_str(),
        time: state.remaining_minutes,
        temp: state.last_temperature_c,
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.mqtt.host = host;
    }
    if let Some(port) = env_parse::<u16>("MQTT_PORT") {
        runtime.mqtt.port = port;
    }
    if let Some(port) = env_parse::<u16>("CONTROLLER_HTTP_PORT") {
        runtime.http_port = port;
    }
    if let Ok(value) = std::env::var("CLIMATE_DRY_RUN") {
        runtime.gpio.dry_run = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse::<T>().ok())
}

struct ConfigStore {
    runtime_path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let runtime_path = std::env::var("CLIMATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("CLIMATE_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./.climate"))
                    .join("runtime.json")
            });
        Self { runtime_path }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %self.runtime_path.display(),
                    "no runtime config found, using defaults"
                );
                Ok(RuntimeConfig::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

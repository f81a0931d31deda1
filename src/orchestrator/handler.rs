use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};

use super::ServerContext;
use crate::error::{ProtocolError, Traceback};
use crate::protocol::{ExecutionResult, PacketType, REQUEST_DATA, REQUEST_SETTINGS, ResultCode, Session};
use crate::settings::{
    CODE_TIMEOUT_BOUNDS, CONTAINER_TIMEOUT_BOUNDS, ExecutionRequest, GlobalSettings, SettingsVersion,
    TimeoutUpdate, clamp_timeout,
};

/// What a connection runs with once the handshake is done
struct Snapshot {
    version: SettingsVersion,
    settings: Arc<GlobalSettings>,
    code_timeout: Duration,
}

/// Drive one connection from admission to its final `DATA` packet
pub async fn handle_connection<S>(context: Arc<ServerContext>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = Arc::new(Session::new(stream, context.io_timeout));
    let id = session.id();

    let Some(_guard) = context.connections.admit(Arc::clone(&session)) else {
        log::info!("Connection {id} from {peer} rejected: too many connections");
        let rejected = ExecutionResult::status(ResultCode::TooManyConnections);
        if let Err(e) = session.finish(&rejected.to_packet()).await {
            log::debug!("Connection {id} gone before rejection: {e}");
        }
        return;
    };
    log::debug!("Connection {id} from {peer} admitted");

    let result = match serve(&context, &session).await {
        Ok(result) => result,
        Err(e) => {
            if e.root_cause().downcast_ref::<ProtocolError>().is_some() {
                log::warn!("Connection {id} protocol failure: {e:#}");
            } else {
                log::error!("Connection {id} failed: {e:#}");
            }
            ExecutionResult::new(
                ResultCode::Exception,
                json!(Traceback::from_error(&e)),
            )
        }
    };

    let delivered = match session.finish(&result.to_packet()).await {
        Err(ProtocolError::TooLarge(size)) => {
            log::warn!("Connection {id} result of {size} bytes is too large to send");
            let error = anyhow::Error::new(ProtocolError::TooLarge(size)).context("Failed to send result");
            let fallback = ExecutionResult::new(ResultCode::Exception, json!(Traceback::from_error(&error)));
            session.finish(&fallback.to_packet()).await.map(|()| fallback.code)
        }
        other => other.map(|()| result.code),
    };
    match delivered {
        Ok(code) => log::info!("Connection {id} finished with result {}", code.code()),
        Err(e) => log::debug!("Connection {id} result not delivered: {e}"),
    }
}

async fn serve(context: &ServerContext, session: &Session) -> Result<ExecutionResult> {
    let version = session
        .expect(PacketType::Init)
        .await
        .context("Failed to receive settings version")?;
    let version = SettingsVersion::new(version.to_text_lossy());

    let snapshot = handshake(context, session, version).await?;

    session
        .send_init(REQUEST_DATA)
        .await
        .context("Failed to request execution data")?;
    let request = session
        .expect(PacketType::Data)
        .await
        .context("Failed to receive execution request")?
        .into_json()?;

    execute(context, ExecutionRequest::from_value(&request), snapshot).await
}

/// Serialized settings exchange; reloads only when the client's version differs
async fn handshake(
    context: &ServerContext,
    session: &Session,
    version: SettingsVersion,
) -> Result<Snapshot> {
    let mut state = context.state.lock().await;

    if state.version.as_ref() != Some(&version) {
        log::info!("Connection {} requests settings {version}", session.id());
        session
            .send_init(REQUEST_SETTINGS)
            .await
            .context("Failed to request settings")?;
        let data = session
            .expect(PacketType::Data)
            .await
            .context("Failed to receive settings")?
            .into_json()?;

        let settings = GlobalSettings::from_value(&data);
        context
            .plugin
            .reload(&settings)
            .context("Failed to apply settings")?;

        match clamp_timeout(settings.container_timeout.as_ref(), CONTAINER_TIMEOUT_BOUNDS) {
            TimeoutUpdate::Set(wait) => {
                log::info!("Container timeout set to {wait:?}");
                context.watchdog.set_duration(wait);
            }
            update => log::debug!("Container timeout kept: {update:?}"),
        }
        match clamp_timeout(settings.code_timeout.as_ref(), CODE_TIMEOUT_BOUNDS) {
            TimeoutUpdate::Set(wait) => {
                log::info!("Code timeout set to {wait:?}");
                state.code_timeout = wait;
            }
            update => log::debug!("Code timeout kept: {update:?}"),
        }

        let debug = settings.debug;
        state.settings = Arc::new(settings);
        state.version = Some(version.clone());
        log::info!("Settings {version} loaded");

        if debug {
            session
                .send_debug(format!("settings {version} loaded"))
                .await
                .context("Failed to send debug notice")?;
        }
    }

    context.watchdog.reset();
    Ok(Snapshot {
        version,
        settings: Arc::clone(&state.settings),
        code_timeout: state.code_timeout,
    })
}

async fn execute(
    context: &ServerContext,
    request: ExecutionRequest,
    snapshot: Snapshot,
) -> Result<ExecutionResult> {
    let cancel = context.shutdown.child_token();
    let plugin = Arc::clone(&context.plugin);
    let settings = Arc::clone(&snapshot.settings);
    let task_cancel = cancel.clone();

    let task =
        tokio::task::spawn_blocking(move || plugin.exec(&request, &settings, &task_cancel));

    match tokio::time::timeout(snapshot.code_timeout, task).await {
        Ok(Ok(Ok(exec))) => Ok(ExecutionResult::new(
            ResultCode::Ok,
            json!({ "exec": exec, "version": snapshot.version.as_str() }),
        )),
        Ok(Ok(Err(e))) => Err(e.context("Execution failed")),
        Ok(Err(e)) => Err(anyhow!("Execution task failed: {e}")),
        Err(_) => {
            log::warn!("Execution exceeded {:?}, abandoning it", snapshot.code_timeout);
            cancel.cancel();
            Ok(ExecutionResult::status(ResultCode::ExecutionTimeout))
        }
    }
}

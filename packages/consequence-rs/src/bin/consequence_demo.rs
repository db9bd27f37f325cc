// Walks through the typical session outcomes against the in-memory connection

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use consequence::memory::{InMemoryConnection, Reaction};
use consequence::{
    Command, CommandCoordinator, CoordinatorConfig, EventKey, ModalAffordances, ModalCoordinator,
    NetworkError, ServerError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
#[allow(dead_code)]
struct CreateTask {
    task_id: u64,
    title: String,
}

impl Command for CreateTask {}

#[derive(Debug, Clone)]
struct TaskCreated {
    task_id: u64,
}

#[derive(Debug, Clone)]
struct TaskRejected {
    reason: String,
}

fn created(task_id: u64) -> Result<EventKey> {
    EventKey::for_value("TaskCreated", "task_id", &task_id).context("Failed to build event key")
}

fn rejected(task_id: u64) -> Result<EventKey> {
    EventKey::for_value("TaskRejected", "task_id", &task_id).context("Failed to build event key")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,consequence=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoordinatorConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(default_timeout = ?config.default_timeout, "Configuration loaded");

    let connection = Arc::new(InMemoryConnection::<CreateTask>::new());
    let coordinator = CommandCoordinator::new(connection.clone()).with_config(config);

    // Event arrives before the timeout
    connection.react_with(Reaction::emit(
        Duration::from_millis(200),
        created(1)?,
        TaskCreated { task_id: 1 },
    ));
    let key = created(1)?;
    let outcome = coordinator
        .run(
            CreateTask {
                task_id: 1,
                title: "Water the plants".into(),
            },
            move |scope| {
                scope
                    .on_event(key)
                    .timeout_after(Duration::from_secs(1))
                    .handled_as(|envelope| async move {
                        if let Some(created) = envelope.downcast_ref::<TaskCreated>() {
                            tracing::info!(task_id = created.task_id, "task created");
                        }
                        Ok(())
                    });
            },
        )
        .await?;
    tracing::info!(?outcome, "event scenario finished");

    // Nothing arrives
    let key = created(2)?;
    let outcome = coordinator
        .run(
            CreateTask {
                task_id: 2,
                title: "Call the plumber".into(),
            },
            move |scope| {
                scope
                    .on_event(key)
                    .with_timeout(Duration::from_millis(300), |key| async move {
                        tracing::warn!(%key, "server never confirmed the task");
                        Ok(())
                    });
            },
        )
        .await?;
    tracing::info!(?outcome, "timeout scenario finished");

    // Rejection beats the event
    connection.react_with(Reaction::emit(
        Duration::from_millis(100),
        rejected(3)?,
        TaskRejected {
            reason: "title already taken".into(),
        },
    ));
    let (event_key, rejection_key) = (created(3)?, rejected(3)?);
    let outcome = coordinator
        .run(
            CreateTask {
                task_id: 3,
                title: "Water the plants".into(),
            },
            move |scope| {
                scope.on_any_rejection(|envelope| async move {
                    if let Some(rejected) = envelope.downcast_ref::<TaskRejected>() {
                        tracing::warn!(reason = %rejected.reason, "task rejected");
                    }
                    Ok(())
                });
                scope.on_event(event_key);
                scope.on_rejection(rejection_key);
            },
        )
        .await?;
    tracing::info!(?outcome, "rejection scenario finished");

    // Posting fails
    connection.fail_next_post(ServerError::new("quota exceeded").with_code("QUOTA").into());
    connection.fail_next_post(NetworkError::new("connection reset").into());
    for task_id in [4, 5] {
        let key = created(task_id)?;
        let outcome = coordinator
            .run(
                CreateTask {
                    task_id,
                    title: "Pay the rent".into(),
                },
                move |scope| {
                    scope
                        .on_post_server_error(|error| async move {
                            tracing::warn!(code = ?error.code, message = %error.message, "server refused the task");
                            Ok(())
                        })
                        .on_network_error(|error| async move {
                            tracing::warn!(%error, "first network hook");
                            Ok(())
                        })
                        .on_network_error(|error| async move {
                            tracing::warn!(%error, "second network hook");
                            Ok(())
                        });
                    scope.on_event(key);
                },
            )
            .await?;
        tracing::info!(?outcome, "post failure scenario finished");
    }

    // Modal dialog with nothing to wait for
    let affordances = ModalAffordances::new().with_close(|| tracing::info!("dialog closed"));
    let modal = ModalCoordinator::new(coordinator.clone(), affordances);
    let positive = modal
        .post(
            CreateTask {
                task_id: 6,
                title: "Fire and forget".into(),
            },
            |scope| {
                scope.on_acknowledge(|| async {
                    tracing::info!("server acknowledged");
                    Ok(())
                });
            },
        )
        .await?;
    tracing::info!(positive, posted = connection.post_count(), "modal scenario finished");

    Ok(())
}

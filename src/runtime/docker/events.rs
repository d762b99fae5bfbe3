//! Engine event stream

use std::collections::HashMap;

use bollard::system::EventsOptions;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::runtime::traits::{RuntimeError, RuntimeEvent, RuntimeResult};

use super::DockerRuntime;

/// Subscribe to container lifecycle events from the engine.
///
/// The stream yields until the engine connection drops; the bridge is
/// responsible for reconnecting.
pub(crate) fn event_stream(
    runtime: &DockerRuntime,
) -> BoxStream<'static, RuntimeResult<RuntimeEvent>> {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);

    let options = EventsOptions::<String> {
        since: None,
        until: None,
        filters,
    };

    let client = runtime.client().clone();

    client
        .events(Some(options))
        .filter_map(|result| async move {
            match result {
                Ok(message) => {
                    let actor = message.actor?;
                    let container_id = actor.id?;
                    let action = message.action?;

                    Some(Ok(RuntimeEvent {
                        container_id,
                        action,
                        attributes: actor.attributes.unwrap_or_default(),
                        timestamp: message.time.unwrap_or(0),
                    }))
                }
                Err(e) => Some(Err(RuntimeError::Docker(e))),
            }
        })
        .boxed()
}

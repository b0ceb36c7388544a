use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::loopback::LoopbackWrapperFactory;
use switchboard_core::{
    DispatchOperation, Dispatcher, DispatcherDeps, DispatcherEvent, OperationState,
    Result as DispatchResult,
};
use switchboard_traits::{ChannelKind, ConnectionId, ReceivedMessage, TargetHandle};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cli::SimulateArgs;
use crate::config::CliConfig;
use crate::output::{OutputFormat, json::print_json_line};
use crate::scenario::{RequestSpec, Scenario};

const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// One line of the transcript.
#[derive(Debug, Serialize)]
struct Record {
    event: &'static str,
    connection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ChannelKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<OperationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Record {
    fn new(event: &'static str, connection: &ConnectionId) -> Self {
        Self {
            event,
            connection: connection.to_string(),
            channel: None,
            kind: None,
            state: None,
            detail: None,
        }
    }

    fn for_operation(event: &'static str, operation: &DispatchOperation) -> Self {
        Self {
            channel: Some(operation.object_path().to_string()),
            kind: Some(operation.kind()),
            state: Some(operation.state()),
            ..Self::new(event, operation.connection())
        }
    }

    fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    fn with_kind(mut self, kind: ChannelKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

struct Transcript {
    format: OutputFormat,
    claimed: usize,
}

impl Transcript {
    fn print(&mut self, record: Record) -> Result<()> {
        if record.event == "claimed" {
            self.claimed += 1;
        }
        if self.format.is_json() {
            return print_json_line(&record);
        }

        let channel = record.channel.as_deref().unwrap_or("-");
        let mut line = format!("{} {}", paint(record.event), channel);
        if let Some(kind) = record.kind {
            line.push_str(&format!(" [{}]", kind));
        }
        if let Some(detail) = &record.detail {
            line.push_str(&format!(" {}", detail));
        }
        println!("{line}");
        Ok(())
    }
}

fn paint(event: &str) -> ColoredString {
    let padded = format!("{:<18}", event);
    match event {
        "claimed" | "tube-handled" => padded.green(),
        "filter-channel" | "filter-tube" => padded.yellow(),
        "dispatch-channel" => padded.cyan(),
        "request" => padded.blue(),
        "connection-lost" | "claim-failed" | "request-failed" => padded.red(),
        _ => padded.dimmed(),
    }
}

/// Replay a scenario and print every dispatcher event.
pub async fn run(args: SimulateArgs, config: &CliConfig, format: OutputFormat) -> Result<()> {
    let scenario = Scenario::load(&args.scenario)?;
    let world = scenario.build();
    let auto_approve = config.simulate.auto_approve && !args.no_approve;
    let auto_claim = config.simulate.auto_claim && !args.no_claim;
    let idle = Duration::from_millis(config.simulate.idle_timeout_ms.max(1));

    let wrappers = Arc::new(LoopbackWrapperFactory::new());
    let dispatcher = Dispatcher::new(
        config.dispatcher.clone(),
        DispatcherDeps {
            contacts: Arc::new(world.contacts),
            wrappers: wrappers.clone(),
            tube_handlers: Arc::new(world.handlers),
        },
    );
    let mut events = dispatcher.subscribe();
    let connection_id = ConnectionId::new(scenario.connection.clone());

    dispatcher.add_connection(world.connection.clone());
    tokio::time::timeout(READY_TIMEOUT, async {
        while !dispatcher.is_backlog_drained(&connection_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .with_context(|| format!("Connection {} never became ready", connection_id))?;

    for channel in &world.live {
        world.connection.announce(channel.clone());
    }

    let (results_tx, mut results) = mpsc::unbounded_channel();
    for request in &scenario.requests {
        let dispatcher = dispatcher.clone();
        let id = connection_id.clone();
        let results_tx = results_tx.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let result = dispatcher
                .request_channel(&id, request.kind, TargetHandle::contact(request.handle), None)
                .await;
            let _ = results_tx.send((request, result));
        });
    }
    drop(results_tx);

    let mut transcript = Transcript { format, claimed: 0 };
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    handle_event(
                        event,
                        &dispatcher,
                        &wrappers,
                        &scenario,
                        &mut transcript,
                        auto_approve,
                        auto_claim,
                    )
                    .await?;
                }
                Err(RecvError::Lagged(skipped)) => warn!("Transcript skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
            Some((request, result)) = results.recv() => {
                transcript.print(request_record(&connection_id, &request, result))?;
            }
            _ = tokio::time::sleep(idle) => break,
        }
    }

    if !format.is_json() {
        println!("{} channel(s) claimed", transcript.claimed);
    }
    Ok(())
}

fn request_record(
    connection: &ConnectionId,
    request: &RequestSpec,
    result: DispatchResult<Arc<DispatchOperation>>,
) -> Record {
    match result {
        Ok(operation) => Record::for_operation("request", &operation)
            .with_detail(format!("to handle {}", request.handle)),
        Err(error) => Record::new("request-failed", connection)
            .with_kind(request.kind)
            .with_detail(error.to_string()),
    }
}

async fn handle_event(
    event: DispatcherEvent,
    dispatcher: &Arc<Dispatcher>,
    wrappers: &LoopbackWrapperFactory,
    scenario: &Scenario,
    transcript: &mut Transcript,
    auto_approve: bool,
    auto_claim: bool,
) -> Result<()> {
    match event {
        DispatcherEvent::Observe(operation) => {
            let mut record = Record::for_operation("observe", &operation);
            if let Some(contact) = operation.contact() {
                record = record.with_detail(format!("with {}", contact.display_name()));
            }
            transcript.print(record)?;

            if let Some(chat) = wrappers.chat_for(operation.object_path()) {
                for message in scenario.messages_for(operation.object_path()) {
                    chat.receive(ReceivedMessage::new(message.clone()));
                }
            }
        }
        DispatcherEvent::FilterChannel(operation) => {
            transcript.print(Record::for_operation("filter-channel", &operation))?;
            if auto_approve {
                operation.approve();
            }
        }
        DispatcherEvent::DispatchChannel(operation) => {
            transcript.print(Record::for_operation("dispatch-channel", &operation))?;
            if !auto_claim {
                return Ok(());
            }
            match operation.claim() {
                Some(claimed) => {
                    let mut record = Record::for_operation("claimed", &operation);
                    if let Some(contact) = &claimed.contact {
                        record = record.with_detail(format!("by handler for {}", contact.display_name()));
                    }
                    transcript.print(record)?;
                }
                None => transcript.print(Record::for_operation("claim-failed", &operation))?,
            }
        }
        DispatcherEvent::FilterTube(tube) => {
            let availability = if tube.activatable {
                "activatable"
            } else {
                "no handler"
            };
            transcript.print(
                Record::new("filter-tube", &tube.connection)
                    .with_channel(tube.channel_path())
                    .with_kind(ChannelKind::Tube)
                    .with_detail(format!("{} #{} ({})", tube.service, tube.tube_id, availability)),
            )?;

            let (event, detail) = if auto_approve {
                dispatcher.process_tube(&tube).await;
                if tube.activatable {
                    ("tube-handled", tube.bus_name.clone())
                } else {
                    ("tube-closed", format!("#{}", tube.tube_id))
                }
            } else {
                dispatcher.decline_tube(&tube).await;
                ("tube-declined", format!("#{}", tube.tube_id))
            };
            transcript.print(
                Record::new(event, &tube.connection)
                    .with_channel(tube.channel_path())
                    .with_kind(ChannelKind::Tube)
                    .with_detail(detail),
            )?;
        }
        DispatcherEvent::ConnectionLost { connection, error } => {
            transcript.print(
                Record::new("connection-lost", &connection).with_detail(error.to_string()),
            )?;
        }
    }
    Ok(())
}

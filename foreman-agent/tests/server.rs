//! Tests for the agent control plane exercised over a real gRPC transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use foreman_agent::Agent;
use foreman_agent::AgentServer;
use foreman_agent::proto::Command;
use foreman_agent::proto::ConnectRequest;
use foreman_agent::proto::SystemInfo;
use foreman_agent::proto::agent_service_client::AgentServiceClient;
use foreman_events::EventStream;
use foreman_events::TaskEvent;
use foreman_events::TaskEventType;
use tokio::sync::mpsc;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tokio_retry2::strategy::MaxInterval;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;

/// How long to wait for any single expected event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives the next event or panics after the timeout.
async fn next_event(receiver: &mut mpsc::Receiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(EVENT_TIMEOUT, receiver.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed unexpectedly")
}

/// Dials the server with a retry backoff, as it starts asynchronously.
async fn connect_client(address: &str) -> AgentServiceClient<Channel> {
    let endpoint = Endpoint::from_shared(address.to_owned()).expect("address should parse");

    let strategy = ExponentialFactorBackoff::from_millis(50, 2.0)
        .max_interval(1000)
        .take(10);

    let channel = Retry::spawn(strategy, || async {
        endpoint.connect().await.map_err(RetryError::transient)
    })
    .await
    .expect("failed to connect to the control plane");

    AgentServiceClient::new(channel)
}

/// Waits until an agent with the given id is registered.
async fn wait_for_registration(server: &AgentServer, agent_id: &str) {
    let strategy = ExponentialFactorBackoff::from_millis(50, 2.0)
        .max_interval(1000)
        .take(10);

    Retry::spawn(strategy, || async {
        if server
            .connected_agents()
            .iter()
            .any(|agent| agent.id == agent_id && agent.connected)
        {
            Ok(())
        } else {
            Err(RetryError::transient("agent not registered yet"))
        }
    })
    .await
    .expect("agent should register");
}

#[tokio::test]
async fn commands_round_trip_through_a_connected_agent() {
    let events = Arc::new(EventStream::new());
    let server = AgentServer::new(events.clone());
    let token = CancellationToken::new();
    let handle = server.serve("127.0.0.1:32051".parse().unwrap(), token.clone());

    // Run a real agent against the server.
    let agent = Agent::from_address("test-agent-1", "http://127.0.0.1:32051")
        .unwrap()
        .with_reconnect_wait(Duration::from_millis(200));
    let agent_token = CancellationToken::new();
    let agent_task = {
        let agent_token = agent_token.clone();
        tokio::spawn(async move { agent.run(agent_token).await })
    };

    wait_for_registration(&server, "test-agent-1").await;

    // An agent registration publishes a worker-connected event keyed by
    // the agent id; it was published before we could subscribe, so only
    // the command streams are asserted on below.
    let commands: [(&str, &str, Vec<&str>); 3] = [
        ("cmd-1", "echo", vec!["Hello World"]),
        ("cmd-2", "ls", vec!["-la"]),
        ("cmd-3", "pwd", vec![]),
    ];

    for (command_id, program, args) in commands {
        let mut subscriber = events.subscribe(command_id).await;

        server
            .dispatch(Command {
                command_id: command_id.into(),
                command: program.into(),
                args: args.into_iter().map(String::from).collect(),
                environment: HashMap::new(),
                agent_id: String::new(),
            })
            .expect("dispatch should succeed");

        let started = next_event(&mut subscriber).await;
        assert_eq!(started.event_type, TaskEventType::TaskStarted);
        assert_eq!(started.execution_id, command_id);

        let output = next_event(&mut subscriber).await;
        assert_eq!(output.event_type, TaskEventType::TaskOutput);
        if command_id == "cmd-1" {
            assert_eq!(output.payload.as_message(), Some("Hello World"));
        }

        let completed = next_event(&mut subscriber).await;
        assert_eq!(completed.event_type, TaskEventType::TaskCompleted);

        // The terminal event closes the channel.
        assert!(
            tokio::time::timeout(EVENT_TIMEOUT, subscriber.recv())
                .await
                .expect("timed out waiting for the channel to close")
                .is_none()
        );
    }

    // A subscription made after the terminal event is born closed.
    let mut late = events.subscribe("cmd-1").await;
    assert!(late.recv().await.is_none());

    agent_token.cancel();
    agent_task
        .await
        .expect("agent task should join")
        .expect("agent should exit cleanly on cancellation");

    token.cancel();
    handle
        .await
        .expect("server task should join")
        .expect("server should shut down cleanly");
}

#[tokio::test]
async fn reregistration_replaces_the_prior_stream() {
    let events = Arc::new(EventStream::new());
    let server = AgentServer::new(events.clone());
    let token = CancellationToken::new();
    let handle = server.serve("127.0.0.1:32052".parse().unwrap(), token.clone());

    let mut client = connect_client("http://127.0.0.1:32052").await;

    let request = ConnectRequest {
        agent_id: "agent-x".into(),
        agent_version: "test".into(),
        system_info: Some(SystemInfo {
            hostname: "host-a".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
        }),
    };

    let mut first = client
        .connect(request.clone())
        .await
        .expect("first registration should succeed")
        .into_inner();

    wait_for_registration(&server, "agent-x").await;

    // A second registration for the same id replaces the first: the
    // registry keeps one entry and the first stream ends.
    let mut second = client
        .connect(request)
        .await
        .expect("second registration should succeed")
        .into_inner();

    let ended = tokio::time::timeout(EVENT_TIMEOUT, first.message())
        .await
        .expect("the replaced stream should end");
    assert!(matches!(ended, Ok(None) | Err(_)));

    assert_eq!(
        server
            .connected_agents()
            .iter()
            .filter(|agent| agent.id == "agent-x")
            .count(),
        1
    );

    // A command pinned to the agent id arrives on the replacement stream.
    server
        .dispatch(Command {
            command_id: "cmd-pinned".into(),
            command: "pwd".into(),
            args: Vec::new(),
            environment: HashMap::new(),
            agent_id: "agent-x".into(),
        })
        .expect("pinned dispatch should succeed");

    let command = tokio::time::timeout(EVENT_TIMEOUT, second.message())
        .await
        .expect("timed out waiting for the pinned command")
        .expect("the replacement stream should be live")
        .expect("the replacement stream should carry the command");
    assert_eq!(command.command_id, "cmd-pinned");
    assert_eq!(command.agent_id, "agent-x");

    token.cancel();
    drop(second);
    handle
        .await
        .expect("server task should join")
        .expect("server should shut down cleanly");
}

#[tokio::test]
async fn queued_commands_are_delivered_to_a_late_agent() {
    let events = Arc::new(EventStream::new());
    let server = AgentServer::new(events.clone());
    let token = CancellationToken::new();
    let handle = server.serve("127.0.0.1:32053".parse().unwrap(), token.clone());

    // No agent is connected yet: the unpinned command waits on the shared
    // queue.
    server
        .dispatch(Command {
            command_id: "cmd-queued".into(),
            command: "echo".into(),
            args: vec!["late".into()],
            environment: HashMap::new(),
            agent_id: String::new(),
        })
        .expect("dispatch should queue");

    let mut subscriber = events.subscribe("cmd-queued").await;

    let agent = Agent::from_address("late-agent", "http://127.0.0.1:32053")
        .unwrap()
        .with_reconnect_wait(Duration::from_millis(200));
    let agent_token = CancellationToken::new();
    let agent_task = {
        let agent_token = agent_token.clone();
        tokio::spawn(async move { agent.run(agent_token).await })
    };

    let started = next_event(&mut subscriber).await;
    assert_eq!(started.event_type, TaskEventType::TaskStarted);

    let output = next_event(&mut subscriber).await;
    assert_eq!(output.event_type, TaskEventType::TaskOutput);
    assert_eq!(output.payload.as_message(), Some("late"));

    let completed = next_event(&mut subscriber).await;
    assert_eq!(completed.event_type, TaskEventType::TaskCompleted);

    agent_token.cancel();
    agent_task
        .await
        .expect("agent task should join")
        .expect("agent should exit cleanly on cancellation");

    token.cancel();
    handle
        .await
        .expect("server task should join")
        .expect("server should shut down cleanly");
}

//! End-to-end broker tests over real Unix domain sockets.
//!
//! Each test starts the full serve loop on sockets under a fresh temporary
//! directory and speaks the plain-text protocols exactly as external clients
//! do. The broker unit tests already pin the dispatch semantics; this file
//! covers what only the socket path exercises:
//!
//! - socket creation and per-plane file modes
//! - the line codec path (CRLF trimming, blank lines, oversized lines)
//! - initial pushes, change pushes, and cascade pushes as seen on the wire
//! - provider disconnect observed by a live subscriber
//! - error replies landing on the offending connection only
//!
//! Ordering trick used throughout: replies and pushes to one session share
//! one FIFO queue, so a round-tripped reply proves that no push was pending
//! ahead of it. Cross-connection ordering goes through `LineClient::sync`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use contextd_core::config::BrokerConfig;
use contextd_daemon::daemon;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, LinesCodec};

/// Maximum time to wait for any single connect/read operation.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Harness
// ============================================================================

/// A running broker bound to sockets under its own temporary directory.
struct TestBroker {
    _dir: TempDir,
    provider_socket: PathBuf,
    subscriber_socket: PathBuf,
}

impl TestBroker {
    /// Spawns the serve loop on fresh socket paths and waits until both
    /// sockets accept connections.
    async fn start() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let provider_socket = dir.path().join("provider.sock");
        let subscriber_socket = dir.path().join("subscriber.sock");

        let mut config = BrokerConfig::default();
        config.daemon.provider_socket = provider_socket.clone();
        config.daemon.subscriber_socket = subscriber_socket.clone();

        tokio::spawn(async move {
            if let Err(err) = daemon::serve(config).await {
                panic!("broker exited with error: {err}");
            }
        });

        let broker = Self {
            _dir: dir,
            provider_socket,
            subscriber_socket,
        };
        broker.wait_ready().await;
        broker
    }

    async fn wait_ready(&self) {
        timeout(TEST_TIMEOUT, async {
            loop {
                let provider_up = UnixStream::connect(&self.provider_socket).await.is_ok();
                let subscriber_up = UnixStream::connect(&self.subscriber_socket).await.is_ok();
                if provider_up && subscriber_up {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("broker sockets did not come up");
    }

    /// Connects a subscriber-plane client.
    async fn subscriber(&self) -> LineClient {
        LineClient::connect(&self.subscriber_socket).await
    }

    /// Connects a provider-plane client and announces it as `id`.
    async fn provider(&self, id: &str) -> LineClient {
        let mut client = LineClient::connect(&self.provider_socket).await;
        client.send(&format!("provider {id}")).await;
        client
    }
}

/// One line-oriented protocol connection.
struct LineClient {
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    write: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(path: &Path) -> Self {
        let stream = timeout(TEST_TIMEOUT, UnixStream::connect(path))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        let (read, write) = stream.into_split();
        Self {
            lines: FramedRead::new(read, LinesCodec::new()),
            write,
        }
    }

    /// Sends one protocol line.
    async fn send(&mut self, line: &str) {
        let framed = format!("{line}\n");
        self.write
            .write_all(framed.as_bytes())
            .await
            .expect("write failed");
    }

    /// Receives the next line, failing the test after the timeout.
    async fn recv(&mut self) -> String {
        timeout(TEST_TIMEOUT, self.lines.next())
            .await
            .expect("no line before timeout")
            .expect("connection closed")
            .expect("line decode failed")
    }

    /// Asserts that the peer has closed the connection.
    async fn expect_eof(&mut self) {
        match timeout(TEST_TIMEOUT, self.lines.next()).await {
            Ok(None) => {},
            other => panic!("expected EOF, got {other:?}"),
        }
    }

    /// Provider-plane barrier: round-trips a command that parses cleanly
    /// but is always rejected by the broker, proving every earlier line
    /// from this connection has been applied.
    async fn sync(&mut self) {
        self.send("unset Sync.Probe").await;
        let line = self.recv().await;
        assert!(line.starts_with("error: "), "unexpected sync reply: {line}");
    }
}

// ============================================================================
// Socket hygiene
// ============================================================================

#[tokio::test]
async fn socket_files_carry_plane_specific_modes() {
    use std::os::unix::fs::PermissionsExt;

    let broker = TestBroker::start().await;

    let provider_mode = std::fs::metadata(&broker.provider_socket)
        .expect("provider socket metadata")
        .permissions()
        .mode();
    let subscriber_mode = std::fs::metadata(&broker.subscriber_socket)
        .expect("subscriber socket metadata")
        .permissions()
        .mode();

    assert_eq!(provider_mode & 0o777, 0o600);
    assert_eq!(subscriber_mode & 0o777, 0o660);
}

// ============================================================================
// Subscriptions and pushes
// ============================================================================

#[tokio::test]
async fn subscription_answers_with_unknown_and_seeded_values() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    // A key nobody ever defined.
    sub.send("new Battery.Charging").await;
    assert_eq!(sub.recv().await, "Battery.Charging = Unknown");

    // The session rule computes "normal" before any screen input exists.
    sub.send("new Session.State").await;
    assert_eq!(sub.recv().await, "Session.State = QString:\"normal\"");
}

#[tokio::test]
async fn value_updates_push_in_order() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("new Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = Unknown");

    let mut provider = broker.provider("battery").await;
    provider.send("add int Battery.ChargePercentage 55").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = int:55");

    provider.send("Battery.ChargePercentage=54").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = int:54");
}

#[tokio::test]
async fn redundant_updates_do_not_cross_the_wire() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("new Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = Unknown");

    let mut provider = broker.provider("battery").await;
    provider.send("add int Battery.ChargePercentage 55").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = int:55");

    // Same value again: the broker must swallow it.
    provider.send("Battery.ChargePercentage=55").await;
    provider.sync().await;

    // The query reply arrives with no push queued ahead of it.
    sub.send("v Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "value: int:55");
}

#[tokio::test]
async fn late_subscriber_receives_current_value_immediately() {
    let broker = TestBroker::start().await;

    let mut provider = broker.provider("battery").await;
    provider.send("add int Battery.ChargePercentage 55").await;
    provider.sync().await;

    let mut sub = broker.subscriber().await;
    sub.send("new Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = int:55");

    sub.send("v Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "value: int:55");
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber() {
    let broker = TestBroker::start().await;

    let mut subs = Vec::new();
    for _ in 0..3 {
        let mut sub = broker.subscriber().await;
        sub.send("new Battery.ChargePercentage").await;
        assert_eq!(sub.recv().await, "Battery.ChargePercentage = Unknown");
        subs.push(sub);
    }

    let mut provider = broker.provider("battery").await;
    provider.send("add int Battery.ChargePercentage 55").await;

    for sub in &mut subs {
        assert_eq!(sub.recv().await, "Battery.ChargePercentage = int:55");
    }
}

#[tokio::test]
async fn unsubscribe_stops_pushes() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("new Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = Unknown");
    sub.send("del Battery.ChargePercentage").await;

    // Force the unsubscribe through before the provider writes.
    sub.send("v Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "value: Unknown");

    let mut provider = broker.provider("battery").await;
    provider.send("add int Battery.ChargePercentage 55").await;
    provider.sync().await;

    // No push was queued; the next reply is the query's.
    sub.send("v Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "value: int:55");
}

// ============================================================================
// Derivation rules on the wire
// ============================================================================

#[tokio::test]
async fn session_state_cascade_is_observable() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("new Session.State").await;
    assert_eq!(sub.recv().await, "Session.State = QString:\"normal\"");

    let mut screen = broker.provider("screen").await;
    screen.send("add bool Screen.Blanked true").await;
    assert_eq!(sub.recv().await, "Session.State = QString:\"blanked\"");

    screen.send("add bool Screen.Fullscreen true").await;
    assert_eq!(sub.recv().await, "Session.State = QString:\"fullscreen\"");

    // Un-blanking changes nothing while fullscreen holds priority.
    screen.send("Screen.Blanked=false").await;
    screen.send("Screen.Fullscreen=false").await;
    assert_eq!(sub.recv().await, "Session.State = QString:\"normal\"");
}

#[tokio::test]
async fn profile_name_sticks_across_invalid_input() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("new Profile.Name").await;
    assert_eq!(sub.recv().await, "Profile.Name = Unknown");

    let mut profiled = broker.provider("profiled").await;
    profiled.send("add string Profile.Active silent").await;
    assert_eq!(sub.recv().await, "Profile.Name = QString:\"silent\"");

    // An empty profile name is rejected by the rule; the output holds.
    profiled.send("Profile.Active=").await;
    profiled.sync().await;
    sub.send("v Profile.Name").await;
    assert_eq!(sub.recv().await, "value: QString:\"silent\"");

    profiled.send("Profile.Active=general").await;
    assert_eq!(sub.recv().await, "Profile.Name = QString:\"general\"");
}

// ============================================================================
// Provider lifecycle
// ============================================================================

#[tokio::test]
async fn provider_disconnect_unsets_every_owned_key() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("new Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = Unknown");
    sub.send("new Battery.Charging").await;
    assert_eq!(sub.recv().await, "Battery.Charging = Unknown");

    {
        let mut battery = broker.provider("battery").await;
        battery.send("add int Battery.ChargePercentage 55").await;
        assert_eq!(sub.recv().await, "Battery.ChargePercentage = int:55");
        battery.send("add bool Battery.Charging true").await;
        assert_eq!(sub.recv().await, "Battery.Charging = bool:true");
    }

    // Closing the connection unsets owned keys in name order.
    assert_eq!(sub.recv().await, "Battery.ChargePercentage = Unknown");
    assert_eq!(sub.recv().await, "Battery.Charging = Unknown");

    sub.send("v Battery.Charging").await;
    assert_eq!(sub.recv().await, "value: Unknown");
    sub.send("providers Battery.Charging").await;
    assert_eq!(sub.recv().await, "providers: ");
}

#[tokio::test]
async fn providers_command_reports_owner_rule_or_nobody() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("providers Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "providers: ");

    let mut provider = broker.provider("battery").await;
    provider.send("add int Battery.ChargePercentage 55").await;
    provider.sync().await;

    sub.send("providers Battery.ChargePercentage").await;
    assert_eq!(
        sub.recv().await,
        "providers: Battery.ChargePercentage@/battery"
    );

    // Derived outputs report the rule instance that computes them.
    sub.send("providers Session.State").await;
    assert_eq!(sub.recv().await, "providers: Session.State@/session-1");
}

// ============================================================================
// Errors and framing
// ============================================================================

#[tokio::test]
async fn errors_are_replied_on_the_offending_connection() {
    let broker = TestBroker::start().await;

    let mut sub = broker.subscriber().await;
    sub.send("frobnicate Battery.ChargePercentage").await;
    assert_eq!(sub.recv().await, "error: unknown command \"frobnicate\"");

    // Declaring before announcing is a broker-level rejection.
    let mut anonymous = LineClient::connect(&broker.provider_socket).await;
    anonymous.send("add int Power.Level 1").await;
    assert_eq!(
        anonymous.recv().await,
        "error: announce with \"provider <id>\" first"
    );

    let mut alpha = broker.provider("alpha").await;
    alpha.send("add int Power.Level 1").await;
    alpha.send("add int Power.Level noise").await;
    assert_eq!(alpha.recv().await, "error: invalid int literal \"noise\"");

    // A second provider cannot write the key, with either command form.
    let mut beta = broker.provider("beta").await;
    beta.send("Power.Level=2").await;
    assert_eq!(
        beta.recv().await,
        "error: beta is not a provider of Power.Level"
    );
    beta.send("add int Power.Level 2").await;
    assert_eq!(
        beta.recv().await,
        "error: property Power.Level is owned by alpha"
    );

    // The first definition locked the type.
    alpha.send("add string Power.Level full").await;
    assert_eq!(
        alpha.recv().await,
        "error: property Power.Level is locked to type int, refusing QString"
    );

    // Every connection above is still usable.
    alpha.send("Power.Level=2").await;
    alpha.sync().await;
    sub.send("v Power.Level").await;
    assert_eq!(sub.recv().await, "value: int:2");
}

#[tokio::test]
async fn writes_to_derived_keys_are_rejected() {
    let broker = TestBroker::start().await;

    let mut rogue = broker.provider("rogue").await;
    rogue.send("add string Session.State hacked").await;
    assert_eq!(
        rogue.recv().await,
        "error: property Session.State is owned by session-1"
    );

    let mut sub = broker.subscriber().await;
    sub.send("v Session.State").await;
    assert_eq!(sub.recv().await, "value: QString:\"normal\"");
}

#[tokio::test]
async fn crlf_and_blank_lines_are_tolerated() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("").await;
    sub.send("v Session.State\r").await;
    assert_eq!(sub.recv().await, "value: QString:\"normal\"");
}

#[tokio::test]
async fn oversized_lines_close_the_session() {
    let broker = TestBroker::start().await;

    let mut sub = broker.subscriber().await;
    sub.send(&"a".repeat(9000)).await;
    sub.expect_eof().await;

    // Other sessions are unaffected.
    let mut other = broker.subscriber().await;
    other.send("v Session.State").await;
    assert_eq!(other.recv().await, "value: QString:\"normal\"");
}

#[tokio::test]
async fn string_values_render_with_escapes() {
    let broker = TestBroker::start().await;
    let mut sub = broker.subscriber().await;

    sub.send("new Message.Text").await;
    assert_eq!(sub.recv().await, "Message.Text = Unknown");

    let mut provider = broker.provider("messenger").await;
    provider.send("add string Message.Text say \"hi\"").await;
    assert_eq!(
        sub.recv().await,
        "Message.Text = QString:\"say \\\"hi\\\"\""
    );
}

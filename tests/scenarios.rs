//! End-to-end scenarios driving the engine against a scripted control
//! client over in-memory IO, with virtual time.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use wifi_direct_go::engine::EngineControl;
use wifi_direct_go::{
    BackChannel, Config, Engine, GroupType, LineChannel, P2pError, Role, TimingLevel,
};

/// Scripted stand-in for the control client: reads the engine's command
/// lines, injects event lines.
struct FakeClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    seen: Vec<String>,
    /// Watchdog for `expect`; generous for virtual-time tests, short for
    /// real-time ones.
    patience: Duration,
}

impl FakeClient {
    fn new() -> (LineChannel, FakeClient) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let channel = LineChannel::from_io(Box::new(near_read), Box::new(near_write));
        let (far_read, far_write) = tokio::io::split(far);
        (
            channel,
            FakeClient {
                reader: BufReader::new(far_read),
                writer: far_write,
                seen: Vec::new(),
                patience: Duration::from_secs(3600),
            },
        )
    }

    async fn inject(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn next_command(&mut self) -> Option<String> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {
                    let command = line.trim_end_matches('\n').to_string();
                    if command.is_empty() {
                        continue;
                    }
                    self.seen.push(command.clone());
                    return Some(command);
                }
            }
        }
    }

    /// Skip commands until `wanted` appears (asserting an in-order
    /// subsequence); panics once the watchdog expires.
    async fn expect(&mut self, wanted: &str) {
        let patience = self.patience;
        let result = tokio::time::timeout(patience, async {
            while let Some(command) = self.next_command().await {
                if command == wanted {
                    return true;
                }
            }
            false
        })
        .await;
        match result {
            Ok(true) => {}
            Ok(false) => panic!("channel closed while waiting for {wanted:?}; saw {:?}", self.seen),
            Err(_) => panic!("timed out waiting for {wanted:?}; saw {:?}", self.seen),
        }
    }

    /// Read whatever is left after the engine was dropped.
    async fn drain(&mut self) -> Vec<String> {
        while self.next_command().await.is_some() {}
        self.seen.clone()
    }
}

struct Scenario {
    fake: FakeClient,
    control: EngineControl,
    handle: JoinHandle<(Engine, Result<(), P2pError>)>,
}

fn start(config: Config, setup: impl FnOnce(&mut Engine)) -> Scenario {
    start_with_role(config, Role::Core, setup)
}

fn start_with_role(config: Config, role: Role, setup: impl FnOnce(&mut Engine)) -> Scenario {
    let (channel, fake) = FakeClient::new();
    let mut engine = Engine::new(config, None, channel, role);
    engine.disable_subprocess_spawn();
    setup(&mut engine);
    let control = engine.control();
    let handle = tokio::spawn(async move {
        let result = engine.run().await;
        (engine, result)
    });
    Scenario {
        fake,
        control,
        handle,
    }
}

fn test_config() -> Config {
    Config {
        interface: "p2p-dev-wlan0".to_string(),
        min_conn_delay: 2,
        ..Config::default()
    }
}

fn hook_trace_file(tag: &str) -> String {
    format!(
        "{}/wifi-direct-go-hooks-{}-{tag}.txt",
        std::env::temp_dir().display(),
        std::process::id()
    )
}

fn read_hook_trace(path: &str) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

// S1: persistent start from an empty supplicant configuration.
#[tokio::test(start_paused = true)]
async fn s1_persistent_start_from_empty_config() {
    let config = Config {
        pbc_in_use: Some(false),
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    fake.inject("Interactive mode").await;
    fake.expect("ping").await;
    fake.expect("ping").await;
    fake.expect("reconfigure").await;
    fake.inject("OK").await;
    fake.expect("p2p_stop_find").await;
    fake.expect("set config_methods keypad").await;
    fake.expect("p2p_find").await;
    // Group probe: no existing group interface.
    fake.expect("interface").await;
    fake.expect("ping").await;
    fake.inject("p2p-dev-wlan0").await;
    fake.inject("PONG").await;
    // No persistent network either.
    fake.expect("list_networks").await;
    fake.expect("ping").await;
    fake.inject("network id / ssid / bssid / flags").await;
    fake.inject("PONG").await;
    fake.expect("p2p_group_add persistent").await;
    fake.inject("P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-xy\" freq=5180").await;
    // Final re-announce.
    fake.expect("p2p_stop_find").await;
    fake.expect("p2p_find").await;

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(engine.active_group(), Some("p2p-wlan0-0"));
    assert!(engine.enroller_running(), "enroller must attach to the group");
    assert_eq!(engine.group_type(), Some(GroupType::GenericPersistent));
}

// S2: PIN enrolment of a known peer through the in-process path.
#[tokio::test(start_paused = true)]
async fn s2_pin_enrolment_of_known_peer() {
    let config = Config {
        pbc_in_use: Some(false),
        pin: "00000000".to_string(),
        ..test_config()
    };
    let scenario = start(config, |engine| {
        engine.set_use_enroller(false);
        engine.set_group("p2p-wlan0-0");
    });
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    fake.inject(
        "<3>P2P-PROV-DISC-SHOW-PIN ee:54:44:24:70:df 93430999 \
         p2p_dev_addr=ee:54:44:24:70:df pri_dev_type=10-0050F204-5 name='testphone' \
         config_methods=0x188 dev_capab=0x25 group_capab=0x0",
    )
    .await;
    fake.expect("interface p2p-wlan0-0").await;
    fake.inject(
        "<3>WPS-ENROLLEE-SEEN ee:54:44:24:70:df 811e2280-33d1-5ce8-97e5-6fcf1598c173 \
         10-0050F204-5 0x4388 0 1 [testphone]",
    )
    .await;
    fake.expect("wps_pin ee:54:44:24:70:df 00000000").await;
    fake.expect("interface p2p-dev-wlan0").await;

    control.terminate().await;
    let (_engine, result) = handle.await.unwrap();
    result.unwrap();
}

// S3: PBC peer not on the white-list is pushed onto the keypad method and
// never connected (P4).
#[tokio::test(start_paused = true)]
async fn s3_pbc_rejection_by_white_list() {
    let config = Config {
        pbc_in_use: Some(true),
        pbc_white_list: vec!["alice".to_string()],
        ..test_config()
    };
    let scenario = start(config, |engine| {
        engine
            .registry_mut()
            .record("aa:bb:cc:dd:ee:ff", "bob", "Notebook");
    });
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    fake.inject("<3>P2P-GO-NEG-REQUEST aa:bb:cc:dd:ee:ff dev_passwd_id=4 go_intent=6")
        .await;
    fake.expect("p2p_stop_find").await;
    fake.expect("set config_methods keypad").await;
    fake.expect("p2p_find").await;

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    drop(engine);
    let seen = fake.drain().await;
    assert!(
        !seen.iter().any(|command| command.starts_with("p2p_connect")),
        "no p2p_connect may be issued for a non-white-listed PBC peer: {seen:?}"
    );
}

// S4: bounded retry loop on group-formation failure. Real time: the hook
// program is a real subprocess, which does not mix with a paused clock.
#[tokio::test]
async fn s4_retry_loop_on_group_formation_failure() {
    let hook_file = hook_trace_file("s4");
    let _ = std::fs::remove_file(&hook_file);
    let config = Config {
        pbc_in_use: Some(false),
        dynamic_group: true,
        activate_persistent_group: false,
        max_num_failures: 3,
        min_conn_delay: 1,
        run_program: Some(format!("echo >>{hook_file}")),
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;
    fake.patience = Duration::from_secs(30);

    fake.inject("<3>P2P-GO-NEG-REQUEST ee:54:44:24:70:df dev_passwd_id=1 go_intent=6")
        .await;
    fake.expect("p2p_connect ee:54:44:24:70:df 00000000 display")
        .await;
    fake.inject("<3>P2P-GROUP-FORMATION-FAILURE").await;
    fake.expect("p2p_connect ee:54:44:24:70:df 00000000 display")
        .await;
    fake.inject("<3>P2P-GROUP-FAILURE-IGNORED").await; // unrelated noise
    fake.inject("<3>P2P-GROUP-FORMATION-FAILURE").await;
    fake.expect("p2p_connect ee:54:44:24:70:df 00000000 display")
        .await;
    fake.inject("<3>P2P-GROUP-FORMATION-FAILURE").await;
    fake.expect("p2p_find").await;

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(engine.num_failures(), 0, "failure counter resets after giving up");
    drop(engine);
    let seen = fake.drain().await;
    assert_eq!(
        seen.iter()
            .filter(|c| c.starts_with("p2p_connect"))
            .count(),
        3,
        "one initial attempt plus two retries: {seen:?}"
    );
    let hooks = read_hook_trace(&hook_file);
    assert!(hooks.contains(&"stop_group".to_string()), "hooks ran: {hooks:?}");
    let _ = std::fs::remove_file(&hook_file);
}

// S5: dynamic teardown once the enroller reports zero sessions. Real time
// for the same reason as S4.
#[tokio::test]
async fn s5_dynamic_teardown_after_disconnect() {
    let hook_file = hook_trace_file("s5");
    let _ = std::fs::remove_file(&hook_file);
    let config = Config {
        pbc_in_use: Some(false),
        dynamic_group: true,
        activate_persistent_group: false,
        run_program: Some(format!("echo >>{hook_file}")),
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;
    fake.patience = Duration::from_secs(30);

    // A negotiated dynamic session forms the group.
    fake.inject("<3>P2P-GO-NEG-REQUEST ee:54:44:24:70:df dev_passwd_id=1 go_intent=6")
        .await;
    fake.expect("p2p_connect ee:54:44:24:70:df 00000000 display")
        .await;
    fake.inject("P2P-GROUP-STARTED p2p-wlan0-2 GO ssid=\"DIRECT-5x\"").await;
    fake.inject("<3>AP-STA-CONNECTED ee:54:44:24:70:df p2p_dev_addr=ee:54:44:24:70:df")
        .await;
    // The station leaves; the Enroller reports an empty group.
    fake.inject("<3>AP-STA-DISCONNECTED ee:54:44:24:70:df p2p_dev_addr=ee:54:44:24:70:df")
        .await;
    fake.inject("HOSTP2PD_ACTIVE_SESSIONS\t0").await;
    fake.expect("p2p_group_remove p2p-wlan0-2").await;
    fake.expect("p2p_find").await;

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(engine.active_group(), None);
    let hooks = read_hook_trace(&hook_file);
    let position = |prefix: &str| hooks.iter().position(|l| l.starts_with(prefix));
    let start_group = position("start_group").expect("start_group hook");
    let connect = position("connect").expect("connect hook");
    let disconnect = position("disconnect").expect("disconnect hook");
    let stop_group = position("stop_group").expect("stop_group hook");
    assert!(
        start_group < connect && connect < disconnect && disconnect < stop_group,
        "hook order: {hooks:?}"
    );
    let _ = std::fs::remove_file(&hook_file);
}

// S6: repeated control-client connection errors above the threshold are
// fatal and clear the enroller.
#[tokio::test(start_paused = true)]
async fn s6_fatal_control_client_death() {
    let config = Config {
        pbc_in_use: Some(false),
        max_num_wpa_cli_failures: 3,
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control: _control,
        handle,
    } = scenario;

    fake.inject("P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-xy\"").await;
    for _ in 0..5 {
        fake.inject("Could not connect to wpa_supplicant: p2p-dev-wlan0 - re-trying")
            .await;
    }
    let (engine, result) = tokio::time::timeout(Duration::from_secs(3600), handle)
        .await
        .expect("engine must terminate on its own")
        .unwrap();
    result.unwrap();
    assert!(!engine.enroller_running(), "termination clears the enroller");
    assert_eq!(engine.active_group(), None);
}

// P2: the enroller handle exists exactly while a group is active.
#[tokio::test(start_paused = true)]
async fn enroller_follows_group_lifecycle() {
    let config = Config {
        pbc_in_use: Some(false),
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    fake.inject("P2P-GROUP-STARTED p2p-wlan0-1 GO ssid=\"DIRECT-ab\"").await;
    fake.inject("P2P-GROUP-REMOVED p2p-wlan0-1 GO reason=REQUESTED").await;
    fake.expect("p2p_find").await;

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(engine.active_group(), None);
    assert!(!engine.enroller_running());
}

// P3: the connect gate suppresses a second p2p_connect inside
// min_conn_delay.
#[tokio::test(start_paused = true)]
async fn p3_connect_rate_gate() {
    let config = Config {
        pbc_in_use: Some(false),
        min_conn_delay: 40,
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    fake.inject("<3>P2P-GO-NEG-REQUEST ee:54:44:24:70:df dev_passwd_id=1 go_intent=6")
        .await;
    fake.expect("p2p_connect ee:54:44:24:70:df 00000000 display persistent")
        .await;
    fake.inject("<3>P2P-GO-NEG-REQUEST ee:54:44:24:70:df dev_passwd_id=1 go_intent=6")
        .await;
    // The gate holds: give the engine a chance to (wrongly) emit another
    // connect before terminating.
    fake.inject("<3>P2P-FIND-STOPPED").await;

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    drop(engine);
    let seen = fake.drain().await;
    assert_eq!(
        seen.iter().filter(|c| c.starts_with("p2p_connect")).count(),
        1,
        "second connect within min_conn_delay must be gated: {seen:?}"
    );
}

// P7: after max_scan_polling consecutive timeouts the read switches to
// the long level.
#[tokio::test(start_paused = true)]
async fn p7_scan_polling_backoff() {
    let config = Config {
        pbc_in_use: Some(false),
        max_scan_polling: 2,
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    let started = Instant::now();
    fake.expect("p2p_find").await; // tick 1, normal timeout
    fake.expect("p2p_find").await; // tick 2, normal timeout
    fake.expect("p2p_find").await; // tick 3, long timeout
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(10 + 10 + 600),
        "third probe must wait for the long level, elapsed {elapsed:?}"
    );

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(engine.level(), TimingLevel::Long);
}

// P9: a transaction gives up after min_conn_delay without responses; the
// activation sequence completes against a silent client.
#[tokio::test(start_paused = true)]
async fn p9_transactions_are_deadline_bounded() {
    let config = Config {
        pbc_in_use: Some(false),
        min_conn_delay: 2,
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    let started = Instant::now();
    fake.inject("Interactive mode").await;
    // No responses at all: reconfigure, group probe and persistent listing
    // all run into their deadlines, yet activation completes through to
    // the final re-announce.
    fake.expect("p2p_stop_find").await;
    fake.expect("interface").await;
    fake.expect("list_networks").await;
    fake.expect("p2p_stop_find").await;
    fake.expect("p2p_find").await;
    assert!(
        started.elapsed() < Duration::from_secs(60),
        "transactions must give up after min_conn_delay each"
    );

    control.terminate().await;
    let (_engine, result) = handle.await.unwrap();
    result.unwrap();
}

// P4 on the enroller: a non-white-listed enrollee falls back to the PIN.
#[tokio::test(start_paused = true)]
async fn enroller_white_list_forces_pin() {
    let (back_near, mut back_far) = tokio::io::duplex(4096);
    let (_back_read, back_write) = tokio::io::split(back_near);
    let config = Config {
        pbc_in_use: Some(true),
        pbc_white_list: vec!["alice".to_string()],
        ..test_config()
    };
    let scenario = start_with_role(
        config,
        Role::Enroller {
            back: BackChannel::from_writer(Box::new(back_write)),
        },
        |engine| {
            engine.set_group("p2p-wlan0-0");
        },
    );
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    fake.inject(
        "<3>WPS-ENROLLEE-SEEN aa:bb:cc:dd:ee:ff 811e2280-33d1-5ce8-97e5-6fcf1598c173 \
         10-0050F204-5 0x4388 0 1 [bob]",
    )
    .await;
    fake.expect("wps_pin aa:bb:cc:dd:ee:ff 00000000").await;

    // The registry update crossed the back-channel.
    let mut record = vec![0u8; 256];
    let n = tokio::io::AsyncReadExt::read(&mut back_far, &mut record)
        .await
        .unwrap();
    let record = String::from_utf8_lossy(&record[..n]).into_owned();
    assert!(
        record.starts_with("HOSTP2PD_ADD_REGISTER\taa:bb:cc:dd:ee:ff\tbob\t"),
        "got record {record:?}"
    );

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    drop(engine);
    let seen = fake.drain().await;
    assert!(
        !seen.iter().any(|c| c.starts_with("wps_pbc")),
        "wps_pbc must not be issued for a non-white-listed peer: {seen:?}"
    );
}

// The enroller counts sessions and reports them over the back-channel.
#[tokio::test(start_paused = true)]
async fn enroller_reports_session_count() {
    let (back_near, mut back_far) = tokio::io::duplex(4096);
    let (_back_read, back_write) = tokio::io::split(back_near);
    let config = Config {
        pbc_in_use: Some(false),
        ..test_config()
    };
    let scenario = start_with_role(
        config,
        Role::Enroller {
            back: BackChannel::from_writer(Box::new(back_write)),
        },
        |engine| {
            engine.set_group("p2p-wlan0-0");
        },
    );
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    fake.inject("<3>AP-STA-CONNECTED ee:54:44:24:70:df p2p_dev_addr=ee:54:44:24:70:df")
        .await;
    fake.expect("ping").await;
    fake.expect("list_sta").await;
    fake.expect("ping").await;
    fake.inject("PONG").await;
    fake.inject("ee:54:44:24:70:df").await;
    fake.inject("PONG").await;

    let mut buf = vec![0u8; 256];
    let n = tokio::io::AsyncReadExt::read(&mut back_far, &mut buf)
        .await
        .unwrap();
    let record = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert_eq!(record, "HOSTP2PD_ACTIVE_SESSIONS\t1\n");

    control.terminate().await;
    let (_engine, result) = handle.await.unwrap();
    result.unwrap();
}

// The Core routes enroller records to the registry and statistics, not to
// the state machine (P8 across the boundary).
#[tokio::test(start_paused = true)]
async fn core_routes_enroller_records() {
    let config = Config {
        pbc_in_use: Some(false),
        ..test_config()
    };
    let scenario = start(config, |_| {});
    let Scenario {
        mut fake,
        control,
        handle,
    } = scenario;

    for _ in 0..3 {
        fake.inject("HOSTP2PD_ADD_REGISTER\tee:54:44:24:70:df\ttestphone\tDual-band Smartphone")
            .await;
    }
    fake.inject("HOSTP2PD_STATISTICS\tWPS-SUCCESS").await;
    fake.inject("<3>P2P-FIND-STOPPED").await;
    fake.expect("p2p_find").await;

    control.terminate().await;
    let (engine, result) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(engine.registry().len(), 1, "record application is idempotent");
    assert_eq!(engine.registry().name_of("ee:54:44:24:70:df"), "testphone");
    assert_eq!(engine.statistics().count("E>WPS-SUCCESS"), 1);
}

//! Top-level event dispatcher.
//!
//! One engine instance runs per process: the Core drives the generic
//! `p2p-dev-*` interface and owns group lifecycle decisions; the Enroller
//! (a child process) runs the same loop bound to one formed group and
//! handles per-peer WPS credentialling. Both consume a single line channel
//! sequentially; synchronous sub-protocols (see `groups.rs`) nest inside
//! the loop and never interleave.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::channel::{LineChannel, LineRead};
use crate::config::{AUTO_INTERFACE, Config};
use crate::enroller::{
    ACTIVE_SESSIONS_RECORD, ADD_REGISTER_RECORD, BackChannel, EnrollerHandle, EnrollerHandoff,
    STATISTICS_RECORD, TERMINATE_ENROLLER_RECORD,
};
use crate::error::P2pError;
use crate::event::{self, ControlEvent, PasswordId};
use crate::hooks::{HookAction, HookRunner};
use crate::pin::{self, PinSupplier, ProgramPin, StaticPin};
use crate::registry::{AddressRegistry, Statistics};
use crate::timing::{TimingLevel, TimingState};

/// Events whose reception is not worth a debug line.
const DO_NOT_DEBUG: [&str; 2] = ["CTRL-EVENT-SCAN-STARTED", "CTRL-EVENT-SCAN-RESULTS"];

/// Which process this engine instance is.
pub enum Role {
    Core,
    Enroller { back: BackChannel },
}

/// How the active group came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    Persistent,
    GenericPersistent,
    Autonomous,
    Negotiated,
    Existing,
}

impl GroupType {
    pub fn label(&self) -> &'static str {
        match self {
            GroupType::Persistent => "Persistent",
            GroupType::GenericPersistent => "Generic persistent",
            GroupType::Autonomous => "Autonomous",
            GroupType::Negotiated => "Negotiated (always won)",
            GroupType::Existing => "Existing autonomous/persistent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) enum Absorbed {
    /// Not a problem line; dispatch it.
    No,
    /// Consumed here; nothing further to do.
    Handled,
    /// Too many control-client failures; terminate.
    Fatal,
}

/// WPS method for an in-process enrolment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrolMethod {
    Pin,
    Pbc,
}

/// Clonable handle for requesting termination or a configuration reload
/// from outside the loop (signal tasks, tests).
#[derive(Clone)]
pub struct EngineControl {
    terminate_tx: mpsc::Sender<()>,
    reload_tx: mpsc::Sender<()>,
}

impl EngineControl {
    pub async fn terminate(&self) {
        let _ = self.terminate_tx.send(()).await;
    }

    pub async fn reload(&self) {
        let _ = self.reload_tx.send(()).await;
    }
}

pub struct Engine {
    pub(crate) config: Config,
    config_file: Option<PathBuf>,
    pub(crate) channel: LineChannel,
    pub(crate) registry: AddressRegistry,
    pub(crate) stats: Statistics,
    pub(crate) timing: TimingState,
    pub(crate) hooks: HookRunner,
    pin_supplier: Box<dyn PinSupplier>,
    last_pin: String,
    role: Role,
    /// Interface name of the active group, if any.
    pub(crate) monitor_group: Option<String>,
    /// SSID of the active persistent/autonomous group.
    pub(crate) ssid_group: Option<String>,
    pub(crate) group_type: Option<GroupType>,
    /// Runtime copy; discovery may pin it to a concrete network entry.
    pub(crate) persistent_network_id: Option<u32>,
    pub(crate) pbc_in_use: Option<bool>,
    config_method_in_use: &'static str,
    /// Last station a connect was attempted for (retry target).
    station: Option<String>,
    pub(crate) num_failures: u32,
    pub(crate) wpa_supplicant_errors: u32,
    do_activation: bool,
    can_register_cmds: bool,
    /// When false, enrolment happens in-process instead of delegating to
    /// the Enroller child.
    use_enroller: bool,
    /// When false, no child processes are created (tests drive the engine
    /// over in-memory IO).
    spawn_processes: bool,
    enroller: Option<EnrollerHandle>,
    terminated: bool,
    terminate_rx: mpsc::Receiver<()>,
    reload_rx: mpsc::Receiver<()>,
    control: EngineControl,
}

impl Engine {
    pub fn new(
        config: Config,
        config_file: Option<PathBuf>,
        channel: LineChannel,
        role: Role,
    ) -> Engine {
        let (terminate_tx, terminate_rx) = mpsc::channel(4);
        let (reload_tx, reload_rx) = mpsc::channel(4);
        let control = EngineControl {
            terminate_tx,
            reload_tx,
        };
        let level = match &role {
            Role::Core => TimingLevel::Normal,
            Role::Enroller { .. } => TimingLevel::Enroller,
        };
        let pin_supplier: Box<dyn PinSupplier> = match &config.pin_program {
            Some(program) => Box::new(ProgramPin::new(program.clone())),
            None => Box::new(StaticPin),
        };
        let last_pin = config.pin.clone();
        crate::redact::register_secret(&last_pin);
        let hooks = HookRunner::new(config.hook_program().map(str::to_string));
        let persistent_network_id = config.persistent_network_id;
        let pbc_in_use = config.pbc_in_use;
        Engine {
            config,
            config_file,
            channel,
            registry: AddressRegistry::default(),
            stats: Statistics::default(),
            timing: TimingState::new(level),
            hooks,
            pin_supplier,
            last_pin,
            role,
            monitor_group: None,
            ssid_group: None,
            group_type: None,
            persistent_network_id,
            pbc_in_use,
            config_method_in_use: "",
            station: None,
            num_failures: 0,
            wpa_supplicant_errors: 0,
            do_activation: false,
            can_register_cmds: false,
            use_enroller: true,
            spawn_processes: true,
            enroller: None,
            terminated: false,
            terminate_rx,
            reload_rx,
            control,
        }
    }

    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn active_group(&self) -> Option<&str> {
        self.monitor_group.as_deref()
    }

    pub fn group_type(&self) -> Option<GroupType> {
        self.group_type
    }

    pub fn enroller_running(&self) -> bool {
        self.enroller.is_some()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AddressRegistry {
        &mut self.registry
    }

    pub fn num_failures(&self) -> u32 {
        self.num_failures
    }

    pub fn level(&self) -> TimingLevel {
        self.timing.level()
    }

    pub fn set_group(&mut self, group: &str) {
        self.monitor_group = Some(group.to_string());
    }

    pub fn set_pbc_in_use(&mut self, pbc: Option<bool>) {
        self.pbc_in_use = pbc;
    }

    /// With `false`, enrolment runs in-process instead of delegating to
    /// the Enroller child.
    pub fn set_use_enroller(&mut self, use_enroller: bool) {
        self.use_enroller = use_enroller;
    }

    /// Never create child processes; group bookkeeping still tracks an
    /// inert Enroller handle.
    pub fn disable_subprocess_spawn(&mut self) {
        self.spawn_processes = false;
    }

    fn is_enroller(&self) -> bool {
        matches!(self.role, Role::Enroller { .. })
    }

    pub(crate) fn back_channel(&mut self) -> Option<&mut BackChannel> {
        match &mut self.role {
            Role::Enroller { back } => Some(back),
            Role::Core => None,
        }
    }

    fn pbc(&self) -> bool {
        self.pbc_in_use.unwrap_or(false)
    }

    pub(crate) async fn send(&mut self, command: &str) -> Result<(), P2pError> {
        self.channel.write_line(command).await
    }

    /// Draw the next PIN and shield it from logs and statistics.
    fn fresh_pin(&mut self) -> String {
        let pin = pin::next_pin(self.pin_supplier.as_mut(), &self.last_pin);
        self.last_pin = pin.clone();
        pin
    }

    /// Run until termination is requested or the channel dies, then run
    /// the termination cascade.
    pub async fn run(&mut self) -> Result<(), P2pError> {
        if !self.is_enroller() {
            self.hooks.run(HookAction::Started, &[]).await;
            info!("service started, interface {:?}", self.config.interface);
            if self.config.interface == AUTO_INTERFACE {
                self.auto_select_interface().await?;
            }
        } else {
            info!(
                "enroller started for group {:?}",
                self.monitor_group.as_deref().unwrap_or("?")
            );
        }
        let result = self.event_loop().await;
        self.terminate().await;
        result
    }

    async fn event_loop(&mut self) -> Result<(), P2pError> {
        loop {
            match self.step().await? {
                Flow::Continue => {}
                Flow::Stop => return Ok(()),
            }
        }
    }

    async fn step(&mut self) -> Result<Flow, P2pError> {
        if self.timing.apply_backoff(self.config.max_scan_polling) {
            debug!(
                "scan backoff: new read timeout {:?}",
                self.config
                    .select_timeout_secs
                    .for_level(self.timing.level())
            );
        }
        let timeout = self
            .config
            .select_timeout_secs
            .for_level(self.timing.level());
        let read = tokio::select! {
            read = self.channel.read_line(timeout) => read?,
            _ = self.terminate_rx.recv() => return Ok(Flow::Stop),
            _ = self.reload_rx.recv() => {
                self.reload_configuration().await?;
                return Ok(Flow::Continue);
            }
        };
        match read {
            LineRead::Eof => {
                debug!("channel closed; terminating");
                Ok(Flow::Stop)
            }
            LineRead::Timeout => self.on_tick().await,
            LineRead::Line(line) => {
                if !DO_NOT_DEBUG.iter().any(|skip| line.contains(skip)) {
                    debug!("recv: {line:?}");
                }
                self.handle_line(&line).await
            }
        }
    }

    /// Periodic work on every read timeout: child liveness and the
    /// `p2p_find` refresh with its polling cap.
    async fn on_tick(&mut self) -> Result<Flow, P2pError> {
        if let Some(status) = self.channel.poll_child() {
            error!("control client died with {status}; terminating");
            return Ok(Flow::Stop);
        }
        if self.enroller.as_mut().is_some_and(EnrollerHandle::exited) {
            warn!("enroller exited; clearing group state");
            self.enroller = None;
            self.clear_group();
            self.timing.set_level(TimingLevel::Normal);
        }
        if self.timing.may_poll(self.config.max_scan_polling) {
            self.timing.note_poll();
            debug!(
                "p2p_find polling after read timeout: {} of {}",
                self.timing.scan_polling(),
                self.config.max_scan_polling
            );
            self.send("p2p_find").await?;
        } else {
            info!(
                "exceeded number of p2p_find pollings after read timeout: {}",
                self.timing.scan_polling()
            );
        }
        Ok(Flow::Continue)
    }

    fn clear_group(&mut self) {
        self.monitor_group = None;
        self.ssid_group = None;
        self.group_type = None;
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow, P2pError> {
        let absorbed = self.absorb_input_problems(line).await?;
        if matches!(absorbed, Absorbed::Fatal) {
            return Ok(Flow::Stop);
        }
        if self.do_activation {
            self.do_activation = false;
            self.activate().await?;
        }
        if matches!(absorbed, Absorbed::Handled) {
            return Ok(Flow::Continue);
        }
        self.wpa_supplicant_errors = 0;

        let Some(event) = ControlEvent::parse(line) else {
            return Ok(Flow::Continue);
        };

        // Internal records are routed to the registry/statistics, never to
        // the state machine.
        match event.tag.as_str() {
            ADD_REGISTER_RECORD => {
                self.registry.apply_record(&event.raw);
                return Ok(Flow::Continue);
            }
            STATISTICS_RECORD => {
                if let Some(name) = event.raw.split('\t').nth(1) {
                    if !name.is_empty() {
                        self.stats.register(&format!("E>{name}"));
                    }
                }
                return Ok(Flow::Continue);
            }
            _ => {}
        }
        if event.raw == self.last_pin || event.tag == self.last_pin {
            return Ok(Flow::Continue);
        }

        let stat_name = if event.tag == "P2P:" {
            "<P2P>".to_string()
        } else {
            event.tag.clone()
        };
        self.account_event(&stat_name).await?;

        if event.tag == "OK" {
            debug!("OK received");
            return Ok(Flow::Continue);
        }
        // Any message other than OK resets the scan-polling streak.
        self.timing.note_activity();

        if event::is_scan_reject(&event.raw) {
            self.timing.note_scan_rejected();
            return Ok(Flow::Continue);
        }

        if self.is_enroller() {
            self.dispatch_enroller(&event, &stat_name).await
        } else {
            self.dispatch_core(&event, &stat_name).await
        }
    }

    /// Absorb activation sentinels, control-client error chatter and the
    /// PIN echo before event dispatch.
    pub(crate) async fn absorb_input_problems(&mut self, line: &str) -> Result<Absorbed, P2pError> {
        if event::is_activation_sentinel(line) {
            if line != "Interactive mode" {
                error!("{line}");
            }
            self.do_activation = true;
            self.timing.set_level(TimingLevel::Normal);
            if !self.is_enroller() {
                self.terminate_enroller().await;
            }
            return Ok(Absorbed::Handled);
        }
        if line.contains("Connected to interface") {
            return Ok(Absorbed::Handled);
        }
        if line == self.last_pin {
            return Ok(Absorbed::Handled);
        }
        if event::is_client_error(line) {
            if self.wpa_supplicant_errors > self.config.wpa_supplicant_min_err_warn {
                error!(
                    "{line} - {} of {}",
                    self.wpa_supplicant_errors, self.config.max_num_wpa_cli_failures
                );
            }
            self.wpa_supplicant_errors += 1;
            self.monitor_group = None;
            self.ssid_group = None;
            if self.wpa_supplicant_errors > self.config.max_num_wpa_cli_failures {
                error!(
                    "giving up after {} control client failures",
                    self.wpa_supplicant_errors
                );
                if let Some(back) = self.back_channel() {
                    let _ = back.send_terminate().await;
                }
                return Ok(Absorbed::Fatal);
            }
            return Ok(Absorbed::Handled);
        }
        if line.contains("'SAVE_CONFIG' command timed out.") {
            error!("supplicant crashed on save_config: missing configuration file");
            return Ok(Absorbed::Handled);
        }
        if line.contains("'PING' command failed.") {
            error!("control client connection error");
            return Ok(Absorbed::Handled);
        }
        if line.contains("wpa_supplicant") {
            warn!("{line}");
            return Ok(Absorbed::Handled);
        }
        Ok(Absorbed::No)
    }

    pub(crate) async fn account_event(&mut self, stat_name: &str) -> Result<(), P2pError> {
        if !self.can_register_cmds || stat_name.is_empty() {
            return Ok(());
        }
        if let Some(back) = self.back_channel() {
            back.send_statistics(stat_name).await
        } else {
            self.stats.register(stat_name);
            Ok(())
        }
    }

    /// Startup sequence, run on the first activation sentinel (and again
    /// after a configuration reload).
    async fn activate(&mut self) -> Result<(), P2pError> {
        if !self.is_enroller() {
            self.reconfigure_supplicant().await?;
        }
        if self.pbc_in_use.is_none() {
            self.pbc_in_use = self.get_config_methods().await?;
        }

        self.send("p2p_stop_find").await?;
        sleep(Duration::from_secs(1)).await;
        if self.pbc() {
            self.send("set config_methods virtual_push_button").await?;
            self.config_method_in_use = "virtual_push_button";
        } else {
            self.send("set config_methods keypad").await?;
            self.config_method_in_use = "keypad";
        }
        self.send("p2p_find").await?;
        sleep(Duration::from_secs(1)).await;

        if self.is_enroller() {
            debug!(
                "enroller active on group {:?}, method {}",
                self.monitor_group.as_deref().unwrap_or("?"),
                self.config_method_in_use
            );
            self.timing.set_level(TimingLevel::Enroller);
        } else {
            self.activate_groups().await?;
        }
        self.can_register_cmds = true;
        Ok(())
    }

    /// Core-side group startup: probe existing groups, apply the startup
    /// group policy, attach the Enroller, re-announce.
    async fn activate_groups(&mut self) -> Result<(), P2pError> {
        if let Some(postfix) = self.config.ssid_postfix.clone() {
            self.send(&format!("p2p_set ssid_postfix {postfix}")).await?;
        }
        self.monitor_group = self.list_or_remove_group(false).await?;
        if self.config.activate_autonomous_group && self.monitor_group.is_none() {
            let mut command = "p2p_group_add".to_string();
            if let Some(opts) = &self.config.p2p_group_add_opts {
                command.push(' ');
                command.push_str(opts);
            }
            self.send(&command).await?;
            self.group_type = Some(GroupType::Autonomous);
            self.monitor_group = self.list_or_remove_group(false).await?;
        }
        if self.monitor_group.is_some() {
            self.ssid_group = self.analyze_existing_group().await?;
        } else {
            let start_group =
                self.config.activate_persistent_group && !self.config.dynamic_group;
            self.ssid_group = self.list_start_pers_group(start_group).await?;
        }
        if let Some(ssid) = &self.ssid_group {
            info!("configured autonomous/persistent group {ssid:?}");
        }
        if let Some(group) = self.monitor_group.clone() {
            info!("active group interface {group:?}");
            self.spawn_enroller().await;
            if self.group_type.is_none() {
                self.group_type = Some(GroupType::Existing);
            }
        }

        self.send("p2p_stop_find").await?;
        sleep(Duration::from_secs(1)).await;
        self.send("p2p_find").await?;
        Ok(())
    }

    /// Reload the configuration file, reconfigure the supplicant and ask
    /// the Enroller to follow. The previous configuration stays in force
    /// when loading fails.
    async fn reload_configuration(&mut self) -> Result<(), P2pError> {
        let Some(path) = self.config_file.clone() else {
            warn!("no configuration file; reload ignored");
            return Ok(());
        };
        match crate::config::reload(&mut self.config, &path) {
            Ok(()) => {
                self.persistent_network_id = self.config.persistent_network_id;
                self.pbc_in_use = self.config.pbc_in_use.or(self.pbc_in_use);
                self.hooks
                    .set_program(self.config.hook_program().map(str::to_string));
                self.pin_supplier = match &self.config.pin_program {
                    Some(program) => Box::new(ProgramPin::new(program.clone())),
                    None => Box::new(StaticPin),
                };
                self.last_pin = self.config.pin.clone();
                crate::redact::register_secret(&self.last_pin);
                if !self.is_enroller() {
                    self.reconfigure_supplicant().await?;
                    if let Some(enroller) = &self.enroller {
                        enroller.signal_reload();
                    }
                }
                self.do_activation = true;
                info!("configuration reloaded");
            }
            Err(e) => error!("loading configuration failed: {e}"),
        }
        Ok(())
    }

    async fn dispatch_enroller(
        &mut self,
        event: &ControlEvent,
        stat_name: &str,
    ) -> Result<Flow, P2pError> {
        match event.tag.as_str() {
            "CTRL-EVENT-DISCONNECTED" => {
                debug!("CTRL-EVENT-DISCONNECTED received: terminating enroller");
                self.count_active_sessions().await?;
                if let Some(back) = self.back_channel() {
                    let _ = back.send_terminate().await;
                }
                Ok(Flow::Stop)
            }
            "AP-DISABLED" => {
                debug!("AP-DISABLED: terminating enroller");
                self.count_active_sessions().await?;
                if let Some(back) = self.back_channel() {
                    let _ = back.send_terminate().await;
                }
                Ok(Flow::Stop)
            }
            "RX-PROBE-REQUEST" => {
                let sa = event.sa.as_deref().unwrap_or("");
                debug!(
                    "probe request from {sa:?} ({})",
                    self.registry.name_of(sa)
                );
                Ok(Flow::Continue)
            }
            "AP-STA-CONNECTED" | "AP-STA-DISCONNECTED" => {
                let addr = event.p2p_dev_addr.as_deref().unwrap_or("");
                debug!(
                    "station {addr:?} ({}) {} group {:?}",
                    self.registry.name_of(addr),
                    if event.tag == "AP-STA-CONNECTED" {
                        "connected to"
                    } else {
                        "disconnected from"
                    },
                    self.monitor_group.as_deref().unwrap_or("?")
                );
                self.count_active_sessions().await?;
                Ok(Flow::Continue)
            }
            "WPS-ENROLLEE-SEEN" => {
                self.wps_enrollee_seen(event).await?;
                Ok(Flow::Continue)
            }
            "CTRL-EVENT-EAP-STARTED" | "CTRL-EVENT-EAP-PROPOSED-METHOD"
            | "CTRL-EVENT-EAP-FAILURE" | "CTRL-EVENT-EAP-RETRANSMIT"
            | "CTRL-EVENT-SUBNET-STATUS-UPDATE" | "WPS-REG-SUCCESS" | "WPS-SUCCESS" => {
                Ok(Flow::Continue)
            }
            _ => self.default_workflow(stat_name).await,
        }
    }

    /// Per-peer WPS credentialling on the group interface.
    async fn wps_enrollee_seen(&mut self, event: &ControlEvent) -> Result<(), P2pError> {
        let Some((mac, device_type, name)) = event.enrollee_seen() else {
            return Ok(());
        };
        let mac = mac.to_string();
        self.registry.record(&mac, &name, device_type);
        if let Some(back) = self.back_channel() {
            back.send_register(&mac, &name, device_type).await?;
        }
        debug!("enrolling {device_type} {name:?} with address {mac:?}");
        let allowed = self.config.pbc_white_list.is_empty()
            || self.config.pbc_white_list.iter().any(|n| n == &name);
        if self.pbc() && allowed {
            self.send(&format!("wps_pbc {mac}")).await?;
        } else {
            let pin = self.fresh_pin();
            self.send(&format!("wps_pin {mac} {pin}")).await?;
        }
        Ok(())
    }

    async fn dispatch_core(
        &mut self,
        event: &ControlEvent,
        stat_name: &str,
    ) -> Result<Flow, P2pError> {
        match event.tag.as_str() {
            TERMINATE_ENROLLER_RECORD => {
                self.terminate_enroller().await;
                self.timing.set_level(TimingLevel::Normal);
                self.clear_group();
                Ok(Flow::Continue)
            }
            ACTIVE_SESSIONS_RECORD => {
                self.active_sessions_report(event).await?;
                Ok(Flow::Continue)
            }
            "P2P-GROUP-FORMATION-SUCCESS" => {
                self.timing.set_level(TimingLevel::Connect);
                Ok(Flow::Continue)
            }
            "P2P-GO-NEG-SUCCESS" => {
                debug!("P2P-GO-NEG-SUCCESS");
                self.timing.set_level(TimingLevel::Connect);
                Ok(Flow::Continue)
            }
            "P2P-DEVICE-FOUND" if event.mac.is_some() => {
                let mac = event.mac.clone().unwrap_or_default();
                let name = event.name.clone().unwrap_or_default();
                let device_type = event.device_type();
                self.registry.record(&mac, &name, device_type);
                debug!("found {device_type} with name {name:?} and address {mac:?}");
                Ok(Flow::Continue)
            }
            "P2P-GO-NEG-REQUEST" if event.mac.is_some() => {
                self.go_neg_request(event).await?;
                Ok(Flow::Continue)
            }
            "P2P-PROV-DISC-PBC-REQ" | "P2P-PROV-DISC-ENTER-PIN"
                if event.mac.is_some() =>
            {
                self.provision_request(event).await?;
                Ok(Flow::Continue)
            }
            "P2P-PROV-DISC-SHOW-PIN" if event.mac.is_some() && event.words.len() > 2 => {
                self.provision_request(event).await?;
                Ok(Flow::Continue)
            }
            "AP-STA-CONNECTED" => {
                let addr = event.p2p_dev_addr.clone().unwrap_or_default();
                let name = self.registry.name_of(&addr).to_string();
                let group = self.monitor_group.clone().unwrap_or_default();
                self.timing.reset_connect_gate();
                self.timing.set_level(TimingLevel::Normal);
                warn!("station {addr:?} ({name}) connected to group {group:?}");
                self.hooks
                    .run(HookAction::Connect, &[&addr, &name, &group])
                    .await;
                Ok(Flow::Continue)
            }
            "AP-STA-DISCONNECTED" => {
                let addr = event.p2p_dev_addr.clone().unwrap_or_default();
                let name = self.registry.name_of(&addr).to_string();
                let group = self.monitor_group.clone().unwrap_or_default();
                warn!("station {addr:?} ({name}) disconnected");
                self.hooks
                    .run(HookAction::Disconnect, &[&addr, &name, &group])
                    .await;
                self.timing.reset_connect_gate();
                self.timing.set_level(TimingLevel::Normal);
                Ok(Flow::Continue)
            }
            "P2P-PROV-DISC-FAILURE" => {
                let addr = event.p2p_dev_addr.clone().unwrap_or_default();
                warn!(
                    "provision discovery failed for station {addr:?} ({})",
                    self.registry.name_of(&addr)
                );
                self.timing.reset_connect_gate();
                self.timing.set_level(TimingLevel::Normal);
                if self.config.dynamic_group && !self.config.activate_persistent_group {
                    self.dynamic_teardown().await?;
                }
                self.send("p2p_find").await?;
                Ok(Flow::Continue)
            }
            "P2P-INVITATION-ACCEPTED" => {
                let id = event
                    .persistent
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                warn!("accepted invitation to persistent group {id}");
                self.timing.set_level(TimingLevel::Connect);
                self.hooks.run(HookAction::StartGroup, &[&id]).await;
                Ok(Flow::Continue)
            }
            "P2P-FIND-STOPPED" => {
                if self.timing.connect_gate_open(self.config.min_conn_delay()) {
                    self.timing.set_level(TimingLevel::Normal);
                    self.send("p2p_find").await?;
                }
                Ok(Flow::Continue)
            }
            "P2P-DEVICE-LOST" => {
                let addr = event.p2p_dev_addr.clone().unwrap_or_default();
                info!(
                    "device lost: {addr:?} ({})",
                    self.registry.name_of(&addr)
                );
                self.timing.set_level(TimingLevel::Normal);
                Ok(Flow::Continue)
            }
            "WPS-TIMEOUT" => {
                error!("received WPS-TIMEOUT");
                self.timing.set_level(TimingLevel::Normal);
                self.timing.reset_connect_gate();
                Ok(Flow::Continue)
            }
            "P2P-GROUP-STARTED" if event.word(1).is_some() => {
                self.timing.set_level(TimingLevel::Connect);
                let group = event.word(1).unwrap_or_default().to_string();
                self.monitor_group = Some(group.clone());
                if let Some(ssid) = &event.ssid {
                    self.ssid_group = Some(ssid.clone());
                }
                warn!(
                    "group started: {group} ({})",
                    self.group_type
                        .map(|t| t.label())
                        .unwrap_or_else(|| GroupType::Autonomous.label())
                );
                self.spawn_enroller().await;
                Ok(Flow::Continue)
            }
            "P2P-GROUP-REMOVED" => {
                self.group_removed(event).await?;
                Ok(Flow::Continue)
            }
            "P2P-GROUP-FORMATION-FAILURE" => {
                self.monitor_group = None;
                self.timing.reset_connect_gate();
                self.timing.set_level(TimingLevel::Normal);
                if self.config.dynamic_group && !self.config.activate_persistent_group {
                    self.retry_or_give_up("group formation failed").await?;
                } else {
                    error!("group formation failed (P2P-GROUP-FORMATION-FAILURE)");
                }
                Ok(Flow::Continue)
            }
            "P2P-GO-NEG-FAILURE" => {
                self.timing.set_level(TimingLevel::Normal);
                self.timing.reset_connect_gate();
                if self.config.dynamic_group && !self.config.activate_persistent_group {
                    self.retry_or_give_up("cannot negotiate P2P Group Owner")
                        .await?;
                }
                Ok(Flow::Continue)
            }
            "FAIL" => {
                self.timing.set_level(TimingLevel::Normal);
                self.timing.reset_connect_gate();
                if self.config.dynamic_group && !self.config.activate_persistent_group {
                    info!("connection failed");
                    self.monitor_group = self.list_or_remove_group(true).await?;
                    self.retry_or_give_up("connection failed").await?;
                }
                Ok(Flow::Continue)
            }
            "FAIL-CHANNEL-UNSUPPORTED" => {
                error!(
                    "the requested channel is not available for P2P \
                     (possibly already in use)"
                );
                Ok(Flow::Continue)
            }
            "CTRL-EVENT-SCAN-STARTED" | "CTRL-EVENT-SCAN-RESULTS"
            | "CTRL-EVENT-EAP-RETRANSMIT" | "CTRL-EVENT-SUBNET-STATUS-UPDATE"
            | "CTRL-EVENT-EAP-STARTED" | "CTRL-EVENT-EAP-PROPOSED-METHOD"
            | "CTRL-EVENT-EAP-FAILURE" | "WPS-REG-SUCCESS" | "WPS-SUCCESS" => {
                Ok(Flow::Continue)
            }
            _ => self.default_workflow(stat_name).await,
        }
    }

    /// Unhandled tags: the terminating notice plus open-ended statistics.
    async fn default_workflow(&mut self, stat_name: &str) -> Result<Flow, P2pError> {
        if stat_name.contains("CTRL-EVENT-TERMINATING") {
            warn!("supplicant terminating");
            self.hooks.run(HookAction::Terminated, &[]).await;
            error!("wpa_supplicant disconnected");
            return Ok(Flow::Continue);
        }
        if self.can_register_cmds && !stat_name.is_empty() {
            let unmanaged = format!("unmanaged_{stat_name}");
            if let Some(back) = self.back_channel() {
                back.send_statistics(&unmanaged).await?;
            } else {
                self.stats.bump(&unmanaged);
            }
        }
        Ok(Flow::Continue)
    }

    /// `HOSTP2PD_ACTIVE_SESSIONS` from the Enroller: a dynamic group is
    /// torn down when its last session disconnects.
    async fn active_sessions_report(&mut self, event: &ControlEvent) -> Result<(), P2pError> {
        let Some(stations) = event
            .raw
            .split('\t')
            .nth(1)
            .and_then(|n| n.parse::<u32>().ok())
        else {
            return Ok(());
        };
        self.stats.set_stations(stations);
        if stations == 0
            && self.config.dynamic_group
            && !self.config.activate_persistent_group
        {
            self.dynamic_teardown().await?;
        }
        self.send("p2p_find").await?;
        Ok(())
    }

    async fn dynamic_teardown(&mut self) -> Result<(), P2pError> {
        if let Some(group) = self.monitor_group.take() {
            self.send(&format!("p2p_group_remove {group}")).await?;
            self.hooks.run(HookAction::StopGroup, &[&group]).await;
        } else {
            self.monitor_group = self.list_or_remove_group(true).await?;
            self.hooks.run(HookAction::StopGroup, &[]).await;
        }
        sleep(Duration::from_secs(3)).await;
        Ok(())
    }

    /// `P2P-GO-NEG-REQUEST`: the provisioning decision for a peer that
    /// negotiates before any group exists.
    async fn go_neg_request(&mut self, event: &ControlEvent) -> Result<(), P2pError> {
        self.timing.set_level(TimingLevel::Connect);
        let mac = event.mac.clone().unwrap_or_default();
        debug!(
            "P2P-GO-NEG-REQUEST received, password ID {:?}, go_intent {:?}",
            event.password_id().label(),
            event.go_intent.as_deref().unwrap_or("")
        );
        if self.pbc() && self.monitor_group.is_none() {
            let Some(name) = self.registry.known_name_of(&mac).map(str::to_string) else {
                error!(
                    "while pbc is in use, cannot find name related to address {mac:?}"
                );
                return Ok(());
            };
            if !self.config.pbc_white_list.is_empty()
                && !self.config.pbc_white_list.iter().any(|n| n == &name)
            {
                self.rotate_config_method().await?;
                return Ok(());
            }
        }
        if self.monitor_group.is_some() {
            let expected = if self.pbc() {
                PasswordId::PushButton
            } else {
                PasswordId::UserSpecified
            };
            if event.password_id() != expected {
                error!(
                    "wrong dev_passwd_id received from address {mac:?}: {:?}",
                    event.dev_passwd_id.as_deref().unwrap_or("")
                );
                return Ok(());
            }
            error!("invalid negotiation request from station with address {mac:?}");
            return Ok(());
        }
        debug!("connecting station with address {mac:?}");
        self.start_session(Some(&mac)).await
    }

    /// `P2P-PROV-DISC-*`: answer a provisioning request according to the
    /// configured method, the white-list and the group state.
    async fn provision_request(&mut self, event: &ControlEvent) -> Result<(), P2pError> {
        self.timing.set_level(TimingLevel::Connect);
        self.timing.reset_connect_gate();
        let mac = event.mac.clone().unwrap_or_default();
        let dev_name = event.name.clone();
        let device_type = event.device_type();
        let pbc = self.pbc();

        match event.tag.as_str() {
            "P2P-PROV-DISC-ENTER-PIN" => {
                error!(
                    "{device_type} {mac:?} with name {:?} asked to enter its PIN to connect",
                    dev_name.as_deref().unwrap_or("")
                );
                self.registry.record_type(&mac, device_type);
            }
            "P2P-PROV-DISC-PBC-REQ" if !pbc => {
                error!(
                    "{device_type} {mac:?} with name {:?} asked to connect with PBC",
                    dev_name.as_deref().unwrap_or("")
                );
                self.registry.record_type(&mac, device_type);
            }
            "P2P-PROV-DISC-SHOW-PIN" if pbc => {
                error!(
                    "{device_type} {mac:?} with name {:?} asked to connect with PIN",
                    dev_name.as_deref().unwrap_or("")
                );
                self.registry.record_type(&mac, device_type);
            }
            _ => {}
        }

        if event.tag == "P2P-PROV-DISC-SHOW-PIN" && !pbc {
            if self.monitor_group.is_some() {
                debug!(
                    "connecting station {:?} ({mac:?}) using PIN to existing group",
                    dev_name.as_deref().unwrap_or("")
                );
                return self.in_process_enrol(&mac, EnrolMethod::Pin).await;
            }
            return self.start_session(Some(&mac)).await;
        }
        if event.tag == "P2P-PROV-DISC-PBC-REQ" && pbc {
            if let Some(name) = &dev_name {
                if !self.config.pbc_white_list.is_empty()
                    && !self.config.pbc_white_list.iter().any(|n| n == name)
                {
                    return self.rotate_config_method().await;
                }
                if self.monitor_group.is_some() {
                    debug!(
                        "connecting station {name:?} ({mac:?}) using PBC to existing group"
                    );
                    return self.in_process_enrol(&mac, EnrolMethod::Pbc).await;
                }
                return self.start_session(Some(&mac)).await;
            }
        }

        debug!(
            "invalid connection request: event {:?}, station {:?}, address {mac:?}, \
             group {:?}, persistent group {:?}",
            event.tag,
            dev_name.as_deref().unwrap_or(""),
            self.monitor_group,
            self.ssid_group
        );
        if pbc {
            self.send(&format!("p2p_prov_disc {mac} pbc")).await?;
        } else {
            self.send(&format!("p2p_prov_disc {mac} keypad")).await?;
        }
        // Clears the stale invitation once the peer's dialogue times out.
        self.in_process_enrol(&mac, EnrolMethod::Pin).await
    }

    /// Issue `p2p_connect` for a peer, honouring the connect-rate gate.
    pub(crate) async fn start_session(&mut self, station: Option<&str>) -> Result<(), P2pError> {
        if !self.timing.connect_gate_open(self.config.min_conn_delay()) {
            debug!("will not p2p_connect: too close to the previous attempt");
            return Ok(());
        }
        self.timing.set_level(TimingLevel::Connect);
        if let Some(mac) = station {
            self.station = Some(mac.to_string());
        }
        let Some(mac) = self.station.clone() else {
            return Ok(());
        };
        self.hooks.run(HookAction::StartGroup, &[]).await;
        let mut command = format!("p2p_connect {mac} ");
        if self.pbc() {
            command.push_str("pbc");
        } else {
            let pin = self.fresh_pin();
            command.push_str(&pin);
            command.push_str(" display");
        }
        if self.config.activate_persistent_group {
            command.push_str(" persistent");
            if let Some(id) = self.persistent_network_id {
                command.push_str(&format!("={id}"));
            }
        }
        if let Some(opts) = &self.config.p2p_connect_opts {
            command.push(' ');
            command.push_str(opts);
        }
        self.send(&command).await?;
        warn!(
            "connection request ({} method): {mac}",
            if self.pbc() { "pbc" } else { "PIN" }
        );
        self.timing.mark_connect();
        self.group_type = Some(GroupType::Negotiated);
        Ok(())
    }

    /// Switch the announced config method between PBC and keypad; used to
    /// push non-white-listed PBC peers onto the PIN path.
    pub(crate) async fn rotate_config_method(&mut self) -> Result<(), P2pError> {
        self.send("p2p_stop_find").await?;
        sleep(Duration::from_secs(2)).await;
        if self.pbc() {
            self.send("set config_methods keypad").await?;
            self.config_method_in_use = "keypad";
            self.pbc_in_use = Some(false);
        } else {
            self.send("set config_methods virtual_push_button").await?;
            self.config_method_in_use = "virtual_push_button";
            self.pbc_in_use = Some(true);
        }
        self.send("p2p_find").await?;
        sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    /// Enrol a station on the group interface from this process. With an
    /// Enroller attached this is a no-op delegation; the child answers the
    /// `WPS-ENROLLEE-SEEN` itself.
    async fn in_process_enrol(&mut self, mac: &str, method: EnrolMethod) -> Result<(), P2pError> {
        if self.use_enroller {
            debug!("using enroller subprocess to connect");
            return Ok(());
        }
        if !self.timing.connect_gate_open(self.config.min_conn_delay()) {
            debug!("will not enroll: too close to the previous attempt");
            return Ok(());
        }
        let Some(group) = self.monitor_group.clone() else {
            return Ok(());
        };
        self.timing.set_level(TimingLevel::Connect);
        debug!("enrol {mac:?} ({method:?}) on group {group:?}");
        self.send(&format!("interface {group}")).await?;
        let deadline = Instant::now() + self.config.max_negotiation_time();
        let mut enrol = Some(method);
        loop {
            match self.transaction_read(deadline).await? {
                None => {
                    error!(
                        "no enrolment request within {} seconds",
                        self.config.max_negotiation_time
                    );
                    enrol = None;
                    break;
                }
                Some(line) => {
                    let Some(event) = ControlEvent::parse(&line) else {
                        continue;
                    };
                    if event.tag == "WPS-ENROLLEE-SEEN"
                        && event.mac.as_deref() == Some(mac)
                    {
                        break;
                    }
                }
            }
        }
        match enrol {
            Some(EnrolMethod::Pin) => {
                let pin = self.fresh_pin();
                self.send(&format!("wps_pin {mac} {pin}")).await?;
            }
            Some(EnrolMethod::Pbc) => {
                self.send(&format!("wps_pbc {mac}")).await?;
            }
            None => {}
        }
        let interface = self.config.interface.clone();
        self.send(&format!("interface {interface}")).await?;
        if enrol.is_some() {
            self.timing.mark_connect();
        }
        debug!("enrol procedure terminated");
        Ok(())
    }

    /// Bounded retry after a formation/negotiation failure.
    async fn retry_or_give_up(&mut self, reason: &str) -> Result<(), P2pError> {
        self.num_failures += 1;
        if self.num_failures < self.config.max_num_failures {
            warn!(
                "retrying ({reason}): {} of {}",
                self.num_failures, self.config.max_num_failures
            );
            if self.num_failures > 1 {
                sleep(Duration::from_secs(2)).await;
            }
            self.start_session(None).await
        } else {
            error!("{reason}");
            self.num_failures = 0;
            self.hooks.run(HookAction::StopGroup, &[]).await;
            self.send("p2p_find").await
        }
    }

    async fn group_removed(&mut self, event: &ControlEvent) -> Result<(), P2pError> {
        self.terminate_enroller().await;
        self.timing.set_level(TimingLevel::Normal);
        let removed = event.word(1).unwrap_or_default().to_string();
        let kind = event.word(2).unwrap_or_default().to_string();
        let reason = event.word(3).unwrap_or_default().to_string();
        match &self.monitor_group {
            Some(group) if group == &removed => {
                info!("removed group {removed:?} of type {kind:?}, {reason}")
            }
            Some(group) => error!(
                "even if active group was {group:?}, removed group {removed:?} \
                 of type {kind:?}, {reason}"
            ),
            None => info!("could not create group {removed:?} of type {kind:?}, {reason}"),
        }
        self.clear_group();
        if self.timing.connect_gate_open(self.config.min_conn_delay()) {
            self.send("p2p_find").await?;
        }
        Ok(())
    }

    /// Attach an Enroller child to the active group (at most one).
    async fn spawn_enroller(&mut self) {
        if !self.use_enroller || self.is_enroller() || self.enroller.is_some() {
            return;
        }
        let Some(group) = self.monitor_group.clone() else {
            return;
        };
        if self.spawn_processes {
            let handoff = EnrollerHandoff {
                config: self.config.clone(),
                group: group.clone(),
                pbc_in_use: self.pbc_in_use,
                config_file: self.config_file.clone(),
            };
            match EnrollerHandle::spawn(&self.channel, &handoff).await {
                Ok(handle) => self.enroller = Some(handle),
                Err(e) => error!("cannot start enroller for group {group:?}: {e}"),
            }
        } else {
            self.enroller = Some(EnrollerHandle::inert(&group));
        }
    }

    async fn terminate_enroller(&mut self) {
        if let Some(mut handle) = self.enroller.take() {
            handle.terminate().await;
        }
    }

    /// Idempotent termination cascade: stop the Enroller, run the
    /// `terminated` hook, close the pty and reap the control client.
    pub(crate) async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        debug!("start termination procedure");
        self.channel.begin_termination();
        self.terminate_enroller().await;
        if !self.is_enroller() {
            self.hooks.run(HookAction::Terminated, &[]).await;
        }
        self.channel.shutdown().await;
        debug!("terminated");
    }
}

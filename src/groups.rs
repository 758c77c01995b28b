//! Synchronous request-response sub-protocols over the line channel.
//!
//! Each transaction writes its commands followed by an echo-ping and
//! consumes the response stream until the matching terminator (`PONG`,
//! `OK`/`FAIL`, a specific event line) or the `min_conn_delay` wall-clock
//! deadline. Unrelated asynchronous events seen meanwhile are pushed back
//! so the main dispatcher sees them on its next iteration.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::channel::LineRead;
use crate::config::AUTO_INTERFACE;
use crate::engine::{Absorbed, Engine, GroupType};
use crate::error::P2pError;
use crate::event::{self, ControlEvent};
use crate::hooks::HookAction;
use crate::timing::TimingLevel;

impl Engine {
    /// One protocol read: absorbs client-error chatter, retries transient
    /// EOFs a bounded number of times and enforces the deadline. `None`
    /// means the deadline expired.
    pub(crate) async fn transaction_read(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<String>, P2pError> {
        let mut read_errors = 0u32;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match self.channel.read_line_raw(deadline - now).await? {
                LineRead::Timeout => return Ok(None),
                LineRead::Eof => {
                    read_errors += 1;
                    if read_errors > self.config.max_num_failures {
                        return Err(P2pError::ChannelClosed(
                            "control client stopped answering".to_string(),
                        ));
                    }
                    warn!("no data while a transaction is in progress");
                    sleep(Duration::from_millis(500)).await;
                }
                LineRead::Line(line) => {
                    debug!("(transaction) read {line:?}");
                    match self.absorb_input_problems(&line).await? {
                        Absorbed::Fatal => {
                            return Err(P2pError::TooManyClientFailures(
                                self.wpa_supplicant_errors,
                            ));
                        }
                        Absorbed::Handled => continue,
                        Absorbed::No => return Ok(Some(line)),
                    }
                }
            }
        }
    }

    pub(crate) fn defer_lines(&mut self, lines: Vec<String>) {
        for line in lines {
            self.channel.push_back(line);
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.min_conn_delay()
    }

    /// Reload the supplicant configuration file: two pings to flush the
    /// prompt, `reconfigure`, then the acknowledging `OK`.
    pub(crate) async fn reconfigure_supplicant(&mut self) -> Result<(), P2pError> {
        debug!("reloading wpa_supplicant configuration file");
        sleep(Duration::from_millis(100)).await;
        self.send("ping").await?;
        sleep(Duration::from_millis(100)).await;
        self.send("ping").await?;
        sleep(Duration::from_millis(100)).await;
        self.send("reconfigure").await?;
        let deadline = self.deadline();
        let mut deferred = Vec::new();
        let mut reloaded = false;
        loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating supplicant configuration reload after timeout \
                     of {} seconds",
                    self.config.min_conn_delay
                );
                break;
            };
            if line.contains("OK") {
                debug!("wpa_supplicant configuration reloaded");
                reloaded = true;
                break;
            }
            deferred.push(line);
        }
        self.defer_lines(deferred);
        if reloaded {
            self.configure_wpa().await?;
        }
        Ok(())
    }

    /// Push `config_parms` into the supplicant with `set key value`,
    /// saving the configuration afterwards when enabled.
    pub(crate) async fn configure_wpa(&mut self) -> Result<Option<bool>, P2pError> {
        if self.config.config_parms.is_empty() {
            return Ok(None);
        }
        debug!("starting configure_wpa procedure");
        let deadline = self.deadline();
        let mut deferred = Vec::new();
        let mut success: Option<bool> = None;
        let parms: Vec<(String, String)> =
            self.config.config_parms.clone().into_iter().collect();
        'parms: for (key, value) in &parms {
            self.send(&format!("set {key} {value}")).await?;
            loop {
                let Some(line) = self.transaction_read(deadline).await? else {
                    error!(
                        "terminating configure_wpa after timeout of {} seconds",
                        self.config.min_conn_delay
                    );
                    success = Some(false);
                    break 'parms;
                };
                if line.contains("FAIL") {
                    error!("cannot set parameter {key:?} to {value:?}");
                    success = Some(false);
                    break;
                }
                if line.contains("OK") {
                    if success.is_none() {
                        success = Some(true);
                    }
                    break;
                }
                deferred.push(line);
            }
        }
        self.defer_lines(deferred);
        match success {
            None => debug!("configure_wpa terminated without updating config"),
            Some(false) => error!("configure_wpa terminated without saving config"),
            Some(true) => {
                if self.config.save_config_enabled {
                    self.flush_channel().await?;
                    self.send("save_config").await?;
                    if !self.ok_fail().await? {
                        error!(
                            "save configuration not allowed by wpa_supplicant; \
                             missing configuration file"
                        );
                    }
                }
                debug!("configure_wpa procedure completed");
            }
        }
        Ok(success)
    }

    /// Discard pending data up to an echo-ping.
    pub(crate) async fn flush_channel(&mut self) -> Result<(), P2pError> {
        debug!("starting flush procedure");
        self.send("ping").await?;
        let deadline = self.deadline();
        let mut deferred = Vec::new();
        while let Some(line) = self.transaction_read(deadline).await? {
            if line.contains("PONG") {
                break;
            }
            deferred.push(line);
        }
        self.defer_lines(deferred);
        Ok(())
    }

    /// Wait for a positional `OK`/`FAIL` acknowledgement.
    pub(crate) async fn ok_fail(&mut self) -> Result<bool, P2pError> {
        let deadline = self.deadline();
        let mut deferred = Vec::new();
        let result = loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating ok_fail after timeout of {} seconds",
                    self.config.min_conn_delay
                );
                break false;
            };
            if line.contains("OK") {
                break true;
            }
            if line.contains("FAIL") {
                break false;
            }
            deferred.push(line);
        };
        self.defer_lines(deferred);
        Ok(result)
    }

    /// Pick the first `p2p-dev-*` interface the control client reports
    /// and switch to it.
    pub(crate) async fn auto_select_interface(&mut self) -> Result<(), P2pError> {
        debug!("starting auto_select_interface");
        self.send("interface").await?;
        self.send("ping").await?;
        let deadline = self.deadline();
        loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating auto_select_interface after timeout of {} seconds",
                    self.config.min_conn_delay
                );
                break;
            };
            if line.contains("PONG") {
                debug!(
                    "terminating auto_select_interface; interface {:?}",
                    self.config.interface
                );
                break;
            }
            let clean = line.trim_start_matches("> ");
            let tokens: Vec<&str> = clean.split('-').collect();
            if tokens.len() != 3 || tokens[0] != "p2p" || tokens[1] != "dev" {
                continue;
            }
            if self.config.interface == AUTO_INTERFACE {
                info!("using interface {clean:?}");
                self.config.interface = clean.to_string();
                let command = format!("interface {clean}");
                self.send(&command).await?;
            } else {
                debug!("list interface {clean:?}");
            }
        }
        Ok(())
    }

    /// List (or remove) formed group interfaces (`p2p-<base>-<n>`). The
    /// last group interface seen is returned; after a removal the
    /// acknowledging `P2P-GROUP-REMOVED` ends the transaction.
    pub(crate) async fn list_or_remove_group(
        &mut self,
        remove: bool,
    ) -> Result<Option<String>, P2pError> {
        debug!("starting list_or_remove_group, remove={remove}");
        self.send("interface").await?;
        self.send("ping").await?;
        let deadline = self.deadline();
        let mut monitor_group: Option<String> = None;
        let mut wait_removal = false;
        let mut can_defer = false;
        let mut deferred = Vec::new();
        loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating group list/deletion after timeout of {} seconds",
                    self.config.min_conn_delay
                );
                break;
            };
            if line.contains("P2P-GROUP-REMOVED ") {
                self.timing.reset_connect_gate();
                self.timing.set_level(TimingLevel::Normal);
                debug!("received {line:?}; terminating group list/deletion");
                break;
            }
            if line.contains("PONG") && !wait_removal {
                debug!("terminating group list/deletion; group {monitor_group:?}");
                break;
            }
            let clean = line.trim_start_matches("> ");
            let tokens: Vec<&str> = clean.split('-').collect();
            let is_group = tokens.len() == 3
                && tokens[0] == "p2p"
                && !tokens[2].is_empty()
                && tokens[2].chars().all(|c| c.is_ascii_digit());
            if !is_group {
                if can_defer {
                    deferred.push(line);
                }
                continue;
            }
            if remove {
                can_defer = true;
                let group = clean.to_string();
                debug!(
                    "removing {group:?}: group {} of interface {}",
                    tokens[2], tokens[1]
                );
                self.send(&format!("p2p_group_remove {group}")).await?;
                wait_removal = true;
                self.hooks.run(HookAction::StopGroup, &[&group]).await;
                monitor_group = None;
                warn!("removed {group}");
                sleep(Duration::from_secs(2)).await;
            } else {
                debug!("found group interface {clean:?}");
                monitor_group = Some(clean.to_string());
            }
        }
        self.defer_lines(deferred);
        Ok(monitor_group)
    }

    /// List persistent networks and optionally (re)start one. Returns the
    /// persistent SSID when one is found or started. Falls back to
    /// creating the network entry, then to a generic persistent group.
    pub(crate) async fn list_start_pers_group(
        &mut self,
        start_group: bool,
    ) -> Result<Option<String>, P2pError> {
        debug!("starting list_start_pers_group, start_group={start_group}");
        if start_group && self.monitor_group.is_some() {
            error!("group {:?} already active", self.monitor_group);
            return Ok(None);
        }
        self.send("list_networks").await?;
        self.send("ping").await?;
        let deadline = self.deadline();
        let mut ssid: Option<String> = None;
        let mut wait_group = false;
        let mut tried_add_network = false;
        let mut deferred = Vec::new();
        let result = loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating persistent group start after timeout of {} seconds",
                    self.config.min_conn_delay
                );
                break ssid;
            };
            if line.contains("P2P-GROUP-STARTED") {
                if let Some(event) = ControlEvent::parse(&line) {
                    if let Some(group) = event.word(1) {
                        self.monitor_group = Some(group.to_string());
                    }
                    if ssid.is_none() {
                        ssid = event.ssid.clone();
                    }
                }
                info!("persistent group started: {:?}", self.monitor_group);
                debug!("persistent group activation completed, ssid {ssid:?}");
                break ssid;
            }
            if line.contains("FAIL") {
                error!("cannot start persistent group");
                break None;
            }
            if line.contains("OK") {
                continue;
            }
            if line.contains("PONG") && !wait_group {
                debug!("no persistent group found yet, ssid {ssid:?}");
                if tried_add_network {
                    error!("could not add network");
                } else {
                    tried_add_network = true;
                    if start_group && self.add_network(deadline).await? {
                        self.send("list_networks").await?;
                        self.send("ping").await?;
                        continue;
                    }
                }
                if start_group
                    && self.config.activate_persistent_group
                    && !self.config.dynamic_group
                    && ssid.is_none()
                {
                    let mut command = "p2p_group_add persistent".to_string();
                    if let Some(opts) = &self.config.p2p_group_add_opts {
                        command.push(' ');
                        command.push_str(opts);
                    }
                    self.send(&command).await?;
                    wait_group = true;
                    warn!("starting generic persistent group");
                    self.group_type = Some(GroupType::GenericPersistent);
                    sleep(Duration::from_secs(1)).await;
                } else {
                    self.send("p2p_find").await?;
                    break ssid;
                }
                continue;
            }
            let clean = line.trim_start_matches("> ");
            let columns: Vec<&str> = clean.split('\t').collect();
            if columns.is_empty() || columns[0] == "network" {
                continue;
            }
            let persistent_row = columns.len() == 4
                && columns[3].contains("[P2P-PERSISTENT]")
                && !columns[0].is_empty()
                && columns[0].chars().all(|c| c.is_ascii_digit());
            if !persistent_row {
                deferred.push(line);
                continue;
            }
            let Ok(id) = columns[0].parse::<u32>() else {
                continue;
            };
            if let Some(wanted) = self.persistent_network_id {
                if wanted != id {
                    debug!(
                        "skipping persistent group {:?} with network ID {id}, \
                         different from {wanted}",
                        columns[1]
                    );
                    continue;
                }
            }
            ssid = Some(columns[1].to_string());
            self.persistent_network_id = Some(id);
            if !start_group {
                continue;
            }
            let mut command = format!("p2p_group_add persistent={id}");
            if let Some(opts) = &self.config.p2p_group_add_opts {
                command.push(' ');
                command.push_str(opts);
            }
            self.send(&command).await?;
            self.group_type = Some(GroupType::Persistent);
            wait_group = true;
            warn!(
                "starting persistent group {:?}, n. {id} in the supplicant \
                 configuration",
                ssid
            );
            let hook_ssid = ssid.clone().unwrap_or_default();
            self.hooks.run(HookAction::StartGroup, &[&hook_ssid]).await;
            sleep(Duration::from_secs(1)).await;
        };
        self.defer_lines(deferred);
        Ok(result)
    }

    /// Create a network entry from `network_parms` and mark it as a
    /// disabled P2P group owner network.
    pub(crate) async fn add_network(&mut self, deadline: Instant) -> Result<bool, P2pError> {
        if self.config.network_parms.is_empty() {
            return Ok(false);
        }
        debug!("starting add_network procedure");
        self.send("add_network").await?;
        let mut deferred = Vec::new();
        let network_id: Option<u32> = loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                error!(
                    "terminating add_network after timeout of {} seconds",
                    self.config.min_conn_delay
                );
                break None;
            };
            if line.contains("FAIL") {
                error!("cannot add network; check configuration and password length");
                break None;
            }
            let clean = line.trim_start_matches("> ");
            let first = clean.split_whitespace().next().unwrap_or("");
            if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) {
                break first.parse().ok();
            }
            deferred.push(line);
        };
        self.defer_lines(deferred);
        let Some(id) = network_id else {
            return Ok(false);
        };
        let parms = self.config.network_parms.clone();
        for parm in &parms {
            self.send(&format!("set_network {id} {parm}")).await?;
            if !self.ok_fail().await? {
                error!("cannot apply network parameter {parm:?} to network {id}");
                return Ok(false);
            }
        }
        self.flush_channel().await?;
        self.send(&format!("set_network {id} mode 3")).await?;
        if !self.ok_fail().await? {
            error!("cannot set \"mode 3\" to network {id}");
        }
        self.send(&format!("set_network {id} disabled 2")).await?;
        if !self.ok_fail().await? {
            error!("cannot set \"disabled 2\" to network {id}");
        }
        if self.config.save_config_enabled {
            self.send("save_config").await?;
            if !self.ok_fail().await? {
                error!("save configuration not supported by wpa_supplicant");
            }
        }
        self.persistent_network_id = None;
        debug!("add_network procedure completed");
        Ok(true)
    }

    /// Correlate the status of the active group interface with a known
    /// persistent SSID (whole-string comparison).
    pub(crate) async fn analyze_existing_group(&mut self) -> Result<Option<String>, P2pError> {
        let Some(group) = self.monitor_group.clone() else {
            error!("no group available");
            return Ok(None);
        };
        debug!("analyzing existing group {group:?}");
        let Some(persistent_ssid) = self.list_start_pers_group(false).await? else {
            info!("no persistent group available for interface {group:?}");
            return Ok(None);
        };
        self.send(&format!("interface {group}")).await?;
        self.send("status").await?;
        let interface = self.config.interface.clone();
        self.send(&format!("interface {interface}")).await?;
        self.send("ping").await?;
        let deadline = self.deadline();
        debug!(
            "listing status of group {group:?}, checking existence of ssid \
             {persistent_ssid:?}"
        );
        let mut ssid = None;
        let mut deferred = Vec::new();
        loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating status retrieve of group {group:?} after timeout \
                     of {} seconds",
                    self.config.min_conn_delay
                );
                break;
            };
            if line.contains("PONG") {
                debug!("terminating analysis; ssid {ssid:?}");
                break;
            }
            let clean = line.trim_start_matches("> ");
            if let Some((key, value)) = clean.split_once('=') {
                if key.contains("ssid") {
                    if value == persistent_ssid {
                        ssid = Some(value.to_string());
                    }
                    debug!("group {group:?} reports status ssid {value:?}");
                    continue;
                }
            }
            deferred.push(line);
        }
        self.defer_lines(deferred);
        Ok(ssid)
    }

    /// Ask the supplicant which WPS config methods are active; keypad
    /// forces the PIN path.
    pub(crate) async fn get_config_methods(&mut self) -> Result<Option<bool>, P2pError> {
        debug!("querying supplicant config_methods");
        self.send("get config_methods").await?;
        self.send("ping").await?;
        let deadline = self.deadline();
        let mut pbc_in_use = self.pbc_in_use;
        let mut found = false;
        let mut deferred = Vec::new();
        loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating get_config_methods after timeout of {} seconds; \
                     pbc_in_use={pbc_in_use:?}",
                    self.config.min_conn_delay
                );
                break;
            };
            if line.contains("virtual_push_button") && !found {
                pbc_in_use = Some(true);
                debug!("use pbc for config_methods, without pin");
                continue;
            }
            if line.contains("keypad") && !found {
                pbc_in_use = Some(false);
                found = true;
                debug!("use keypad for config_methods, with pin");
                continue;
            }
            if line.contains("PONG") {
                debug!("config methods decided: pbc_in_use={pbc_in_use:?}");
                break;
            }
            deferred.push(line);
        }
        self.defer_lines(deferred);
        Ok(pbc_in_use)
    }

    /// Count connected stations of the group with `list_sta`; the first
    /// ping flushes stale data, the second delimits the listing. The
    /// result is reported to the Core over the back-channel.
    pub(crate) async fn count_active_sessions(&mut self) -> Result<u32, P2pError> {
        debug!("starting count_active_sessions");
        let group = self.monitor_group.clone();
        let switch_interface = self.back_channel().is_none();
        if switch_interface {
            if let Some(group) = &group {
                let command = format!("interface {group}");
                self.send(&command).await?;
            }
        }
        self.send("ping").await?;
        self.send("list_sta").await?;
        self.send("ping").await?;
        let deadline = self.deadline();
        let mut stations = 0u32;
        let mut flushing = true;
        let mut deferred = Vec::new();
        loop {
            let Some(line) = self.transaction_read(deadline).await? else {
                debug!(
                    "terminating count_active_sessions after timeout of {} seconds",
                    self.config.min_conn_delay
                );
                break;
            };
            if flushing {
                if line.contains("PONG") {
                    flushing = false;
                }
                continue;
            }
            if event::is_mac_line(&line) {
                stations += 1;
                debug!("active station {line:?}; n_stations={stations}");
                continue;
            }
            if line.contains("PONG") {
                debug!("terminating count_active_sessions; n_stations={stations}");
                break;
            }
            deferred.push(line);
        }
        self.defer_lines(deferred);
        if let Some(back) = self.back_channel() {
            back.send_active_sessions(stations).await?;
        }
        if switch_interface {
            let interface = self.config.interface.clone();
            self.send(&format!("interface {interface}")).await?;
        }
        Ok(stations)
    }
}

use super::wait::{InputAction, WaitController, WaitProgress, WaitResult, extract_output};
use super::*;

use crate::config::EXIT_CONFIG_COMMAND;
use crate::device::is_auth_failure;

/// How long `close` waits for an in-flight command to unwind before leaving
/// the transport to be dropped with the session.
const CLOSE_LOCK_WAIT: Duration = Duration::from_secs(2);

/// How long to listen for an unsolicited greeting before the first wake-up.
const GREETING_WAIT: Duration = Duration::from_millis(300);

/// Login questions answered before giving up.
const MAX_LOGIN_ROUNDS: usize = 4;

impl Session {
    /// Creates an unconnected session. The config is validated here.
    pub fn new(
        host: String,
        port: u16,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Result<Session, ConnectError> {
        let matcher = config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let created_at = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            host,
            port,
            credentials,
            recorder: SessionRecorder::bounded(config.record_level, config.record_max_entries),
            config,
            matcher,
            created_at,
            last_activity_ms: AtomicI64::new(created_at.timestamp_millis()),
            mode: RwLock::new(DeviceMode::Unknown),
            closed: AtomicBool::new(false),
            shutdown,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Last observed device mode.
    pub fn mode(&self) -> DeviceMode {
        self.mode.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last successful read or write.
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    /// True after `close`, or after a transport failure.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True while connect or a command holds the session.
    pub fn is_busy(&self) -> bool {
        self.state.try_lock().is_err()
    }

    /// Recorded history of this session.
    pub fn history(&self) -> Vec<SessionRecordEntry> {
        self.recorder.entries()
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            device_mode: self.mode().as_prompt_str().to_string(),
            connected_at: self.created_at,
            last_activity: self.last_activity(),
            busy: self.is_busy(),
        }
    }

    fn device_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn set_mode(&self, mode: DeviceMode) {
        let mut guard = self.mode.write().unwrap_or_else(|e| e.into_inner());
        if *guard != mode {
            debug!("{} mode {} -> {}", self.id, guard, mode);
            self.recorder.record_event(SessionEvent::ModeChanged {
                prompt: mode.as_prompt_str().to_string(),
            });
            *guard = mode;
        }
    }

    /// Opens the transport and brings the device to a known prompt.
    ///
    /// Sequence: open, wake (bare line terminators until a prompt or login
    /// question shows up), login, leave config mode if needed, disable
    /// paging. Any failure closes the transport and marks the session closed.
    pub async fn connect(&self) -> Result<DeviceMode, ConnectError> {
        let mut guard = self.state.lock().await;
        if self.is_closed() {
            return Err(ConnectError::Aborted);
        }
        let addr = self.device_addr();

        let transport = Transport::open(
            &self.host,
            self.port,
            self.config.connect_timeout(),
            self.shutdown.subscribe(),
            self.config.telnet_negotiation,
        )
        .await
        .map_err(|err| match err {
            TransportError::Closed => ConnectError::Aborted,
            other => ConnectError::Unreachable {
                addr: addr.clone(),
                source: other,
            },
        });
        let transport = match transport {
            Ok(transport) => transport,
            Err(err) => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.touch();

        let state = &mut *guard;
        state.transport = Some(transport);
        state.buffer.clear();
        state.out_of_step = false;

        match self.bring_up(state).await {
            Ok(mode) => {
                debug!("{} session {} ready at {}", addr, self.id, mode);
                self.set_mode(mode.clone());
                self.recorder
                    .record_event(SessionEvent::ConnectionEstablished {
                        device_addr: addr,
                        prompt: mode.as_prompt_str().to_string(),
                    });
                Ok(mode)
            }
            Err(err) => {
                debug!("{} connect failed: {}", addr, err);
                self.closed.store(true, Ordering::SeqCst);
                if let Some(mut transport) = state.transport.take() {
                    transport.close().await;
                }
                state.buffer.clear();
                Err(err)
            }
        }
    }

    async fn bring_up(&self, state: &mut SessionState) -> Result<DeviceMode, ConnectError> {
        let terminator = self.config.line_terminator.clone();
        let connect_timeout = self.config.connect_timeout();

        // Wake: some devices print nothing until they see a line terminator.
        // Attempt zero only listens, so a greeting already on the wire is not
        // answered with an empty line.
        let mut first = None;
        let mut wake_output = String::new();
        for attempt in 0..=self.config.wake_attempts {
            trace!("{} wake attempt {}", self.id, attempt);
            let (text, wait) = if attempt == 0 {
                (None, self.config.wake_interval().min(GREETING_WAIT))
            } else {
                (Some(terminator.as_str()), self.config.wake_interval())
            };
            let (result, output) = self
                .exchange(state, ConnectPhase::Wake, text, wait)
                .await?;
            wake_output.push_str(&output);
            if matches!(result.outcome, Outcome::Complete | Outcome::AwaitingInput) {
                first = Some(result);
                break;
            }
        }
        let Some(mut result) = first else {
            return Err(ConnectError::PromptNotFound {
                phase: ConnectPhase::Wake,
                output: wake_output,
            });
        };

        if result.outcome == Outcome::AwaitingInput {
            result = self.login(state, result).await?;
        }
        let mut mode = result.mode.unwrap_or_default();

        if mode.is_config() && self.config.exit_config_on_connect {
            debug!("{} leaving configuration mode {}", self.id, mode);
            let command = format!("{EXIT_CONFIG_COMMAND}{terminator}");
            mode = self
                .expect_prompt(state, ConnectPhase::ExitConfig, &command, connect_timeout)
                .await?;
        }

        if !self.config.pager_disable_command.is_empty() {
            let command = format!("{}{}", self.config.pager_disable_command, terminator);
            mode = self
                .expect_prompt(state, ConnectPhase::DisablePaging, &command, connect_timeout)
                .await?;
            debug!("{} paging disabled", self.id);
        }

        Ok(mode)
    }

    /// Answers username and password questions until a prompt appears.
    async fn login(
        &self,
        state: &mut SessionState,
        mut result: WaitResult,
    ) -> Result<WaitResult, ConnectError> {
        let terminator = &self.config.line_terminator;
        let mut sent_username = false;
        let mut sent_password = false;

        for _ in 0..MAX_LOGIN_ROUNDS {
            let answer = match result.pending_input {
                Some(InputKind::Username) => {
                    if sent_username {
                        return Err(ConnectError::AuthRejected(
                            "username requested again".to_string(),
                        ));
                    }
                    let Some(username) = self.credentials.username.as_ref() else {
                        return Err(ConnectError::AuthRejected(
                            "device requested a username but none was supplied".to_string(),
                        ));
                    };
                    sent_username = true;
                    format!("{username}{terminator}")
                }
                Some(InputKind::Password) => {
                    if sent_password {
                        return Err(ConnectError::AuthRejected(
                            "password requested again".to_string(),
                        ));
                    }
                    let Some(password) = self.credentials.password.as_ref() else {
                        return Err(ConnectError::AuthRejected(
                            "device requested a password but none was supplied".to_string(),
                        ));
                    };
                    sent_password = true;
                    format!("{password}{terminator}")
                }
                Some(InputKind::Confirm) | None => {
                    return Err(ConnectError::PromptNotFound {
                        phase: ConnectPhase::Login,
                        output: String::new(),
                    });
                }
            };
            debug!("{} answering login question {:?}", self.id, result.pending_input);

            let (next, output) = self
                .exchange(
                    state,
                    ConnectPhase::Login,
                    Some(&answer),
                    self.config.connect_timeout(),
                )
                .await?;
            if is_auth_failure(&output) {
                let banner = output
                    .lines()
                    .map(str::trim)
                    .find(|line| is_auth_failure(line))
                    .unwrap_or("authentication failed")
                    .to_string();
                return Err(ConnectError::AuthRejected(banner));
            }
            match next.outcome {
                Outcome::Complete => return Ok(next),
                Outcome::AwaitingInput => result = next,
                Outcome::TimedOut | Outcome::PagerLimit => {
                    return Err(ConnectError::PromptNotFound {
                        phase: ConnectPhase::Login,
                        output,
                    });
                }
            }
        }
        Err(ConnectError::AuthRejected(
            "too many login questions".to_string(),
        ))
    }

    /// Sends a command during bring-up and requires a prompt back.
    async fn expect_prompt(
        &self,
        state: &mut SessionState,
        phase: ConnectPhase,
        command: &str,
        wait: Duration,
    ) -> Result<DeviceMode, ConnectError> {
        let (result, output) = self.exchange(state, phase, Some(command), wait).await?;
        match (result.outcome, result.mode) {
            (Outcome::Complete, Some(mode)) => Ok(mode),
            _ => Err(ConnectError::PromptNotFound { phase, output }),
        }
    }

    /// One write/wait round during bring-up. Questions are handed back.
    async fn exchange(
        &self,
        state: &mut SessionState,
        phase: ConnectPhase,
        text: Option<&str>,
        wait: Duration,
    ) -> Result<(WaitResult, String), ConnectError> {
        let fail = |source: TransportError| {
            if self.is_closed() {
                ConnectError::Aborted
            } else {
                ConnectError::Transport { phase, source }
            }
        };
        let transport = state.transport.as_mut().ok_or(ConnectError::Aborted)?;
        if let Some(text) = text {
            transport.write(text).await.map_err(fail)?;
        }
        let mut buffer = String::new();
        let mut progress = WaitProgress::default();
        let result = WaitController::new(
            transport,
            &self.matcher,
            &self.recorder,
            self.config.wait.max_pager_continuations,
        )
        .run(&mut buffer, &mut progress, wait, |_| InputAction::Yield)
        .await
        .map_err(fail)?;
        self.touch();
        trace!("{} {} output {:?}", self.id, phase, buffer);
        Ok((result, buffer))
    }

    /// Executes a command and waits for its output.
    ///
    /// `wait` is a hint: long-running commands are given at least the
    /// configured floor. A timeout is not an error; it returns the partial
    /// output with [`Outcome::TimedOut`]. A transport failure closes the
    /// session.
    pub async fn execute(
        &self,
        command: &str,
        wait: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        if self.is_closed() {
            return Err(ExecError::SessionClosed(self.id.clone()));
        }

        let queue_timeout = self.config.queue_timeout();
        let mut guard = if queue_timeout.is_zero() {
            self.state
                .try_lock()
                .map_err(|_| ExecError::SessionBusy(self.id.clone()))?
        } else {
            tokio::time::timeout(queue_timeout, self.state.lock())
                .await
                .map_err(|_| ExecError::SessionBusy(self.id.clone()))?
        };
        if self.is_closed() {
            return Err(ExecError::SessionClosed(self.id.clone()));
        }

        let state = &mut *guard;
        let Some(transport) = state.transport.as_mut() else {
            return Err(ExecError::SessionClosed(self.id.clone()));
        };

        match transport.drain_pending().await {
            Ok(stale) if !stale.is_empty() => {
                warn!("{} discarding stale output {:?}", self.id, stale);
            }
            Ok(_) => {}
            Err(err) => return Err(self.fail(state, err).await),
        }

        let hint = wait.unwrap_or_else(|| self.config.default_wait());
        let effective = self.config.wait.effective_wait(command, hint);
        if effective > hint {
            debug!(
                "{} long-running command {:?}, wait raised to {:?}",
                self.id, command, effective
            );
        }

        let mode_before = self.mode();
        let full_command = format!("{}{}", command, self.config.line_terminator);
        if let Err(err) = transport.write(&full_command).await {
            return Err(self.fail(state, err).await);
        }
        self.touch();
        debug!("{} exec {:?} (wait {:?})", self.id, command, effective);

        let terminator = self.config.line_terminator.as_str();
        let enable_password = self.credentials.enable_password.as_deref();
        let mut enable_sent = false;
        let mut progress = WaitProgress::default();
        state.buffer.clear();
        let respond = |kind: InputKind| match (kind, enable_password) {
            (InputKind::Password, Some(secret)) if !enable_sent => {
                enable_sent = true;
                InputAction::Reply(format!("{secret}{terminator}"))
            }
            _ => InputAction::Yield,
        };
        let resync = if state.out_of_step {
            debug!("{} previous command ended early, waiting for the echo", self.id);
            command
        } else {
            ""
        };

        let result = tokio::time::timeout(
            self.config.max_command_time(),
            WaitController::new(
                transport,
                &self.matcher,
                &self.recorder,
                self.config.wait.max_pager_continuations,
            )
            .resync_on_echo(resync)
            .run(&mut state.buffer, &mut progress, effective, respond),
        )
        .await;

        let result = match result {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(self.fail(state, err).await),
            Err(_) => {
                warn!(
                    "{} command {:?} hit the {:?} ceiling",
                    self.id,
                    command,
                    self.config.max_command_time()
                );
                WaitResult {
                    outcome: Outcome::TimedOut,
                    mode: None,
                    pending_input: None,
                }
            }
        };
        // Late output of an unfinished command may still be on its way.
        state.out_of_step = result.outcome.is_incomplete();
        if !state.buffer.is_empty() {
            self.touch();
        }

        if let Some(mode) = result.mode.or(progress.stale_mode) {
            self.set_mode(mode);
        }
        let mode = self.mode();
        if result.outcome.is_incomplete() {
            warn!(
                "{} command {:?} ended {:?} with {} bytes of partial output",
                self.id,
                command,
                result.outcome,
                state.buffer.len()
            );
        }

        let output = extract_output(
            &self.matcher,
            &state.buffer,
            command,
            result.outcome.is_complete(),
        );
        state.buffer.clear();

        self.recorder.record_event(SessionEvent::CommandCompleted {
            command: command.to_string(),
            outcome: result.outcome,
            prompt_before: mode_before.as_prompt_str().to_string(),
            prompt_after: mode.as_prompt_str().to_string(),
            output: output.clone(),
        });

        Ok(CommandOutput {
            output,
            mode,
            outcome: result.outcome,
            pending_input: result.pending_input,
            pager_continuations: progress.continuations,
        })
    }

    /// Tears the session down after a transport failure.
    async fn fail(&self, state: &mut SessionState, err: TransportError) -> ExecError {
        let forced = self.is_closed();
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut transport) = state.transport.take() {
            transport.close().await;
        }
        state.buffer.clear();
        if forced {
            debug!("{} command interrupted by disconnect", self.id);
            ExecError::SessionClosed(self.id.clone())
        } else {
            warn!("{} transport failure: {}", self.id, err);
            self.recorder.record_event(SessionEvent::ConnectionClosed {
                reason: format!("transport failure: {err}"),
                prompt_before: self.mode().prompt().map(str::to_string),
            });
            ExecError::Transport(err)
        }
    }

    /// Raises the closed flag and wakes any blocked read. Does not wait.
    pub fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    /// Closes the session.
    ///
    /// Safe to call while a command is in flight: the pending read fails at
    /// once and that command returns `SessionClosed`.
    pub async fn close(&self) {
        let already = self.is_closed();
        self.abort();
        match tokio::time::timeout(CLOSE_LOCK_WAIT, self.state.lock()).await {
            Ok(mut state) => {
                if let Some(mut transport) = state.transport.take() {
                    transport.close().await;
                }
                state.buffer.clear();
            }
            Err(_) => debug!(
                "{} still busy, transport is released when the command unwinds",
                self.id
            ),
        }
        if !already {
            self.recorder.record_event(SessionEvent::ConnectionClosed {
                reason: "disconnect".to_string(),
                prompt_before: self.mode().prompt().map(str::to_string),
            });
        }
        debug!("{} session closed", self.id);
    }
}

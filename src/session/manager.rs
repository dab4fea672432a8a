use super::*;

impl SessionRegistry {
    /// Creates an empty registry whose sessions use `config`.
    pub fn new(config: SessionConfig) -> Self {
        // No capacity bound and no idle eviction: sessions leave only on disconnect.
        let sessions = Cache::builder().build();
        Self { sessions, config }
    }

    /// Default config applied to new sessions.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Registers a new, not yet connected session and returns it.
    ///
    /// The session is listable (mode `unknown`) while it connects, so a
    /// failed or abandoned connect can still be found and cleaned up.
    pub async fn create(
        &self,
        host: String,
        port: u16,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Result<Arc<Session>, ConnectError> {
        let session = Arc::new(Session::new(host, port, credentials, config)?);
        self.sessions
            .insert(session.id().to_string(), session.clone())
            .await;
        debug!(
            "Registered session {} for {}:{}",
            session.id(),
            session.host(),
            session.port()
        );
        Ok(session)
    }

    /// Creates and connects a session.
    ///
    /// `connect_timeout` overrides the registry default for this session only.
    /// On failure the session is removed again.
    pub async fn connect(
        &self,
        host: String,
        port: u16,
        credentials: Credentials,
        connect_timeout: Option<Duration>,
    ) -> Result<(Arc<Session>, DeviceMode), ConnectError> {
        let mut config = self.config.clone();
        if let Some(timeout) = connect_timeout {
            config.connect_timeout_ms = timeout.as_millis() as u64;
        }
        let session = self.create(host, port, credentials, config).await?;
        match session.connect().await {
            Ok(mode) => Ok((session, mode)),
            Err(err) => {
                self.sessions.invalidate(session.id()).await;
                session.close().await;
                Err(err)
            }
        }
    }

    /// Looks a session up by id.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>, ExecError> {
        self.sessions
            .get(id)
            .await
            .ok_or_else(|| ExecError::SessionNotFound(id.to_string()))
    }

    /// Runs a command on a session. The registry itself is not locked while
    /// the command runs.
    pub async fn execute(
        &self,
        id: &str,
        command: &str,
        wait: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        let session = self.get(id).await?;
        let result = session.execute(command, wait).await;
        if let Err(ExecError::Transport(_)) = &result {
            debug!("Dropping session {} after transport failure", id);
            self.sessions.invalidate(id).await;
        }
        result
    }

    /// All sessions ordered by connect time, then id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos = self
            .sessions
            .iter()
            .map(|(_, session)| session.info())
            .collect::<Vec<_>>();
        infos.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }

    /// Removes a session from the table without closing it.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).await
    }

    /// Removes and closes a session. Safe while a command is in flight.
    pub async fn disconnect(&self, id: &str) -> Result<(), ExecError> {
        let session = self
            .remove(id)
            .await
            .ok_or_else(|| ExecError::SessionNotFound(id.to_string()))?;
        session.close().await;
        debug!("Session {} disconnected", id);
        Ok(())
    }

    /// Closes every session and empties the table.
    pub async fn shutdown(&self) {
        let sessions = self
            .sessions
            .iter()
            .map(|(_, session)| session)
            .collect::<Vec<_>>();
        // Raise every flag first so in-flight commands unwind in parallel.
        for session in &sessions {
            session.abort();
        }
        for session in sessions {
            self.sessions.invalidate(session.id()).await;
            session.close().await;
        }
        debug!("Session registry drained");
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

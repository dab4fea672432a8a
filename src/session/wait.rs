use super::*;

use tokio::time::Instant;

use crate::device::{classify, detect_device_mode, render_line};

/// What to do about a question the device asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum InputAction {
    /// Send this text and keep reading.
    Reply(String),
    /// Stop reading and hand the question to the caller.
    Yield,
}

/// Terminal state of one wait loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct WaitResult {
    pub outcome: Outcome,
    /// Mode from the prompt that completed the loop.
    pub mode: Option<DeviceMode>,
    pub pending_input: Option<InputKind>,
}

impl WaitResult {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            mode: None,
            pending_input: None,
        }
    }
}

/// Loop state kept by the caller, so it is still there when an outer
/// timeout drops the loop.
#[derive(Debug, Default)]
pub(super) struct WaitProgress {
    pub continuations: u32,
    /// Last prompt seen in output that belonged to an earlier command.
    pub stale_mode: Option<DeviceMode>,
}

/// Reads after a write until the prompt returns or the budget runs out.
///
/// The budget is a deadline, not a sleep: the loop returns the moment a
/// prompt is recognised. Time spent waiting for the device to answer a pager
/// continuation is not charged against the budget.
pub(super) struct WaitController<'a> {
    transport: &'a mut Transport,
    matcher: &'a PromptMatcher,
    recorder: &'a SessionRecorder,
    max_pager_continuations: u32,
    resync: Option<&'a str>,
}

impl<'a> WaitController<'a> {
    pub fn new(
        transport: &'a mut Transport,
        matcher: &'a PromptMatcher,
        recorder: &'a SessionRecorder,
        max_pager_continuations: u32,
    ) -> Self {
        Self {
            transport,
            matcher,
            recorder,
            max_pager_continuations,
            resync: None,
        }
    }

    /// Treats everything up to the echo of `command` as output of an earlier
    /// command. Used when the previous command ended before its prompt.
    pub fn resync_on_echo(mut self, command: &'a str) -> Self {
        if !command.trim().is_empty() {
            self.resync = Some(command);
        }
        self
    }

    /// Runs the loop, appending everything read to `buffer`.
    ///
    /// The buffer and `progress` live with the caller so that they survive
    /// when the caller cancels this future through an outer timeout.
    pub async fn run<F>(
        &mut self,
        buffer: &mut String,
        progress: &mut WaitProgress,
        wait: Duration,
        mut respond: F,
    ) -> Result<WaitResult, TransportError>
    where
        F: FnMut(InputKind) -> InputAction,
    {
        let mut deadline = Instant::now() + wait;
        // Budget left when the last continuation was sent, while its answer is pending.
        let mut paused: Option<Duration> = None;
        // A continuation was sent and no new text has arrived since; the
        // marker may still be on screen while the device erases it.
        let mut page_requested = false;

        loop {
            let max_wait = match paused {
                Some(left) => left,
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("{} wait budget exhausted", self.transport.addr());
                        return Ok(WaitResult::new(Outcome::TimedOut));
                    }
                    deadline - now
                }
            };

            let chunk = match self.transport.read_available(max_wait).await? {
                ReadOutcome::TimedOut if paused.is_some() => {
                    debug!("{} no answer to pager continuation", self.transport.addr());
                    return Ok(WaitResult::new(Outcome::TimedOut));
                }
                ReadOutcome::TimedOut => continue,
                ReadOutcome::Data(chunk) => chunk,
            };
            if let Some(left) = paused.take() {
                deadline = Instant::now() + left;
            }
            if chunk.is_empty() {
                continue;
            }
            self.recorder.record_raw_chunk(&chunk);
            if chunk.chars().any(|c| !c.is_whitespace() && !c.is_control()) {
                page_requested = false;
            }
            buffer.push_str(&chunk);

            if let Some(command) = self.resync {
                match locate_echo(buffer, command) {
                    Some((end, mode)) => {
                        debug!(
                            "{} discarding {} bytes of earlier output",
                            self.transport.addr(),
                            end
                        );
                        buffer.replace_range(..end, "");
                        if mode.is_some() {
                            progress.stale_mode = mode;
                        }
                        self.resync = None;
                    }
                    None => {
                        if let TailState::Prompt(mode) = self.matcher.inspect(buffer) {
                            debug!("{} skipping earlier prompt {}", self.transport.addr(), mode);
                            progress.stale_mode = Some(mode);
                            buffer.clear();
                        }
                        continue;
                    }
                }
            }

            match self.matcher.inspect(buffer) {
                TailState::Prompt(mode) => {
                    trace!("{} prompt {:?}", self.transport.addr(), mode);
                    let mut result = WaitResult::new(Outcome::Complete);
                    result.mode = Some(mode);
                    return Ok(result);
                }
                TailState::More if page_requested => {
                    trace!("{} pager marker still being erased", self.transport.addr());
                }
                TailState::More => {
                    if progress.continuations >= self.max_pager_continuations {
                        warn!(
                            "{} pager continuation limit {} reached",
                            self.transport.addr(),
                            self.max_pager_continuations
                        );
                        return Ok(WaitResult::new(Outcome::PagerLimit));
                    }
                    progress.continuations += 1;
                    self.transport.write(" ").await?;
                    page_requested = true;
                    paused = Some(deadline.saturating_duration_since(Instant::now()));
                }
                TailState::Input(kind) => match respond(kind) {
                    InputAction::Reply(text) => {
                        trace!("{} answering {:?}", self.transport.addr(), kind);
                        self.transport.write(&text).await?;
                    }
                    InputAction::Yield => {
                        let mut result = WaitResult::new(Outcome::AwaitingInput);
                        result.pending_input = Some(kind);
                        return Ok(result);
                    }
                },
                TailState::Pending => {}
            }
        }
    }
}

/// Finds the echo of `command` among the complete lines of `buffer`.
///
/// The echo is a line equal to the command, or a prompt immediately followed
/// by it. Returns the offset just past that line and the mode of the last
/// prompt before it, if there was one.
pub(super) fn locate_echo(buffer: &str, command: &str) -> Option<(usize, Option<DeviceMode>)> {
    let command = command.trim();
    let mut start = 0;
    while let Some(pos) = buffer[start..].find('\n') {
        let end = start + pos + 1;
        let rendered = render_line(&buffer[start..end - 1]);
        let line = rendered.trim();
        if line == command {
            let mode = detect_device_mode(&buffer[..start]);
            return Some((end, (mode != DeviceMode::Unknown).then_some(mode)));
        }
        if let Some(prefix) = line.strip_suffix(command) {
            let prompt = classify(prefix);
            if prompt.complete {
                return Some((end, Some(prompt.mode)));
            }
        }
        start = end;
    }
    None
}

/// Extracts the command's own output from the raw buffer.
///
/// Drops leading blank lines, the echoed command line and, when the loop
/// completed on a prompt, the trailing prompt line.
pub(super) fn extract_output(
    matcher: &PromptMatcher,
    raw: &str,
    command: &str,
    strip_prompt: bool,
) -> String {
    let normalized = matcher.normalize(raw);
    let mut lines: Vec<&str> = normalized.split('\n').collect();

    let first = lines.iter().position(|line| !line.trim().is_empty());
    match first {
        Some(idx) => {
            lines.drain(..idx);
        }
        None => return String::new(),
    }

    let command = command.trim();
    let echoed = !command.is_empty()
        && lines.first().is_some_and(|first| {
            let first = first.trim();
            first == command
                || first
                    .strip_suffix(command)
                    .is_some_and(|prefix| classify(prefix).complete)
        });
    if echoed {
        lines.remove(0);
    }

    if strip_prompt {
        lines.pop();
    }

    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    while lines.first().is_some_and(|line| line.trim().is_empty()) {
        lines.remove(0);
    }
    lines.join("\n")
}

//! A scripted Cisco-style device served over a local TCP listener.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rtelnet::SessionConfig;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const HOSTNAME: &str = "SW3";
pub const PING_DELAY: Duration = Duration::from_millis(4_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    User,
    Privileged,
    Config,
    ConfigIf,
}

impl Mode {
    fn prompt(self) -> String {
        let suffix = match self {
            Mode::User => ">",
            Mode::Privileged => "#",
            Mode::Config => "(config)#",
            Mode::ConfigIf => "(config-if)#",
        };
        format!("{HOSTNAME}{suffix}")
    }
}

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Username and password asked for before the first prompt.
    pub login: Option<(String, String)>,
    /// Secret asked for by `enable`; `None` enables without asking.
    pub enable_secret: Option<String>,
    pub start_mode: Mode,
    /// Print a banner and prompt without waiting for a line terminator.
    pub greet: bool,
    /// Never print anything.
    pub mute: bool,
    /// Open with telnet option requests.
    pub negotiate: bool,
    /// Erase the pager marker with backspaces and spaces sent in two writes.
    pub split_erase: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            login: None,
            enable_secret: None,
            start_mode: Mode::User,
            greet: false,
            mute: false,
            negotiate: false,
            split_erase: false,
        }
    }
}

/// Handle to a running device. Every accepted connection is an independent
/// console with its own mode.
pub struct FakeDevice {
    pub port: u16,
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    pub async fn start(options: DeviceOptions) -> FakeDevice {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let options = Arc::new(options);

        let lines = received.clone();
        let task = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let options = options.clone();
                let lines = lines.clone();
                tokio::spawn(async move {
                    let _ = serve(sock, options, lines).await;
                });
            }
        });
        FakeDevice {
            port,
            received,
            task,
        }
    }

    /// Every line the device read, across all connections.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().expect("lock").clone()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Session defaults shortened for tests.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        wake_interval_ms: 300,
        connect_timeout_ms: 2_000,
        ..SessionConfig::default()
    }
}

struct Console {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    mode: Mode,
}

impl Console {
    async fn send(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await
    }

    async fn erase_pager(&mut self, split: bool) -> std::io::Result<()> {
        if !split {
            return self.send("\r          \r").await;
        }
        self.send(&"\u{8}".repeat(10)).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.send(&format!("{}{}", " ".repeat(10), "\u{8}".repeat(10)))
            .await
    }

    /// Three pages of five lines. Returns false when the reader quit early.
    async fn pages(&mut self, split_erase: bool) -> std::io::Result<bool> {
        for page in 0..3 {
            if page > 0 {
                self.send(" --More-- ").await?;
                let key = self.reader.read_u8().await?;
                self.erase_pager(split_erase).await?;
                if key != b' ' {
                    return Ok(false);
                }
            }
            for n in 1..=5 {
                self.send(&format!("line {}\r\n", page * 5 + n)).await?;
            }
        }
        Ok(true)
    }

    async fn prompt(&mut self) -> std::io::Result<()> {
        let prompt = self.mode.prompt();
        self.send(&prompt).await
    }

    /// One line without its terminator, telnet commands stripped. `None` on EOF.
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut raw = Vec::new();
        if self.reader.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(None);
        }
        let mut bytes = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] == 255 {
                i += 3;
                continue;
            }
            bytes.push(raw[i]);
            i += 1;
        }
        let line = String::from_utf8_lossy(&bytes);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

async fn serve(
    sock: TcpStream,
    options: Arc<DeviceOptions>,
    received: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (reader, writer) = sock.into_split();
    let mut console = Console {
        reader: BufReader::new(reader),
        writer,
        mode: options.start_mode,
    };

    if options.mute {
        while console.read_line().await?.is_some() {}
        return Ok(());
    }
    if options.negotiate {
        // DO ECHO, WILL SUPPRESS-GO-AHEAD
        console.writer.write_all(&[255, 253, 1, 255, 251, 3]).await?;
    }

    if let Some((user, pass)) = &options.login {
        console
            .send("\r\n\r\nUser Access Verification\r\n\r\nUsername: ")
            .await?;
        loop {
            let Some(u) = console.read_line().await? else {
                return Ok(());
            };
            console.send(&format!("{u}\r\nPassword: ")).await?;
            let Some(p) = console.read_line().await? else {
                return Ok(());
            };
            if &u == user && &p == pass {
                break;
            }
            console
                .send("\r\n% Authentication failed\r\n\r\nUsername: ")
                .await?;
        }
        console.send("\r\n").await?;
        console.prompt().await?;
    } else if options.greet {
        console.send("\r\nWelcome to SW3\r\n\r\n").await?;
        console.prompt().await?;
    }

    loop {
        let Some(line) = console.read_line().await? else {
            return Ok(());
        };
        received.lock().expect("lock").push(line.clone());
        let cmd = line.trim().to_string();
        console.send(&format!("{cmd}\r\n")).await?;

        match cmd.as_str() {
            "" | "terminal length 0" => {}
            "show clock" => console.send("*10:00:00.123 UTC Mon Mar 1 2027\r\n").await?,
            "show stuck" => {
                console.send("Building configuration...\r\n").await?;
                continue;
            }
            "show long" => {
                if !console.pages(options.split_erase).await? {
                    console.send("\r\n").await?;
                }
            }
            "show long hang" => {
                console.pages(options.split_erase).await?;
                continue;
            }
            "enable" => {
                if let Some(secret) = &options.enable_secret {
                    console.send("Password: ").await?;
                    let Some(answer) = console.read_line().await? else {
                        return Ok(());
                    };
                    if &answer == secret {
                        console.mode = Mode::Privileged;
                        console.send("\r\n").await?;
                    } else {
                        console.send("\r\n% Bad secrets\r\n\r\n").await?;
                    }
                } else {
                    console.mode = Mode::Privileged;
                }
            }
            "configure terminal" | "conf t" if console.mode == Mode::Privileged => {
                console
                    .send("Enter configuration commands, one per line.  End with CNTL/Z.\r\n")
                    .await?;
                console.mode = Mode::Config;
            }
            c if c.starts_with("interface ")
                && matches!(console.mode, Mode::Config | Mode::ConfigIf) =>
            {
                console.mode = Mode::ConfigIf;
            }
            "end" if matches!(console.mode, Mode::Config | Mode::ConfigIf) => {
                console.mode = Mode::Privileged;
            }
            "exit" => match console.mode {
                Mode::ConfigIf => console.mode = Mode::Config,
                Mode::Config => console.mode = Mode::Privileged,
                _ => return Ok(()),
            },
            "quit" => return Ok(()),
            "reload" => {
                console.send("Proceed with reload? [confirm]").await?;
                if console.read_line().await?.is_none() {
                    return Ok(());
                }
                console.send("\r\nReload aborted\r\n").await?;
            }
            c if c.starts_with("show slow ") => {
                let ms: u64 = c["show slow ".len()..].trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                console.send(&format!("done after {ms} ms\r\n")).await?;
            }
            c if c.starts_with("ping ") => {
                let target = &c["ping ".len()..];
                console
                    .send(&format!(
                        "Type escape sequence to abort.\r\nSending 5, 100-byte ICMP Echos to {target}, timeout is 2 seconds:\r\n"
                    ))
                    .await?;
                tokio::time::sleep(PING_DELAY).await;
                console
                    .send("!!!!!\r\nSuccess rate is 100 percent (5/5), round-trip min/avg/max = 1/2/4 ms\r\n")
                    .await?;
            }
            _ => {
                console
                    .send("                  ^\r\n% Invalid input detected at '^' marker.\r\n\r\n")
                    .await?;
            }
        }
        console.prompt().await?;
    }
}

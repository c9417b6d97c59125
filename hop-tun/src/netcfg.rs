//! Interface configuration through the host's `netsh` utility
//!
//! Address, DNS, route, metric and MTU changes are applied by running `netsh`
//! with a fixed argument grammar. The process runner sits behind
//! [`CommandRunner`] so the grammar and the exit-status handling can be
//! exercised without a Windows host.

use std::fmt;
use std::io::{self, Read};
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::{MAX_MTU, MIN_MTU};

/// Default bound on a single `netsh` invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const NETSH: &str = "netsh";
const IPCONFIG: &str = "ipconfig";

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful, silent output
    pub fn ok() -> Self {
        Self {
            status: Some(0),
            ..Default::default()
        }
    }

    /// Failed output with the given exit code and stderr text
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stderr if non-empty, stdout otherwise (netsh reports most errors on stdout)
    pub fn message(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs an external program and waits for it at most `timeout`
///
/// Arguments are command-line tokens: quotes inside them are part of the
/// command line the program sees, not escaped.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `std::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let mut command = Command::new(program);
        push_args(&mut command, args);
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Both pipes are drained while the child runs so a chatty command
        // never blocks on a full pipe
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(CommandOutput {
                    status: status.code(),
                    stdout: collect(stdout)?,
                    stderr: collect(stderr)?,
                });
            }

            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout {
                    command: render_command(program, args),
                    timeout,
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let buf = reader
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe reader panicked"))??;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// netsh parses its own command line, so arguments go through verbatim
#[cfg(windows)]
fn push_args(command: &mut Command, args: &[String]) {
    use std::os::windows::process::CommandExt;

    for arg in args {
        command.raw_arg(arg);
    }
}

#[cfg(not(windows))]
fn push_args(command: &mut Command, args: &[String]) {
    command.args(args);
}

/// Applies interface settings by invoking `netsh`
#[derive(Clone)]
pub struct NetshConfigurator {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Default for NetshConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetshConfigurator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetshConfigurator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl NetshConfigurator {
    /// Configurator running real processes with the default timeout
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    /// Configurator using a custom runner
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the per-invocation timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current per-invocation timeout
    pub fn command_timeout(&self) -> Duration {
        self.timeout
    }

    /// `netsh interface ip set address name=<if> static <ip> <mask>`
    pub fn set_ip_address(&self, interface: &str, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        check_netmask(mask)?;
        self.netsh(&set_address_args(interface, address, mask))?;
        log::info!("Set {} address to {}/{}", interface, address, mask);
        Ok(())
    }

    /// `netsh interface ip set dns name=<if> static <ip>`
    pub fn set_dns_server(&self, interface: &str, server: Ipv4Addr) -> Result<()> {
        self.netsh(&set_dns_args(interface, server))?;
        log::info!("Set {} DNS server to {}", interface, server);
        Ok(())
    }

    /// `netsh interface ipv4 add route <dest>/<cidr> <if> <gateway> metric=<n>`
    ///
    /// An "already exists" failure is treated as success.
    pub fn add_route(
        &self,
        interface: &str,
        destination: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
        metric: u32,
    ) -> Result<()> {
        let prefix = check_netmask(mask)?;
        let args = add_route_args(interface, destination, prefix, gateway, metric);
        let output = self.runner.run(NETSH, &args, self.timeout)?;

        if output.success() {
            log::info!(
                "Added route {}/{} via {} on {} (metric {})",
                destination,
                prefix,
                gateway,
                interface,
                metric
            );
            return Ok(());
        }

        if output.message().to_ascii_lowercase().contains("exists") {
            log::debug!("Route {}/{} already exists on {}", destination, prefix, interface);
            return Ok(());
        }

        Err(command_failed(NETSH, &args, &output))
    }

    /// `netsh interface ipv4 set interface <if> metric=<n>`
    pub fn set_interface_metric(&self, interface: &str, metric: u32) -> Result<()> {
        self.netsh(&set_metric_args(interface, metric))?;
        log::info!("Set {} interface metric to {}", interface, metric);
        Ok(())
    }

    /// `netsh interface ipv4 set subinterface <if> mtu=<n> store=persistent`
    pub fn set_mtu(&self, interface: &str, mtu: u32) -> Result<()> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::InvalidArgument(format!(
                "MTU {} is outside {}..={}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }
        self.netsh(&set_mtu_args(interface, mtu))?;
        log::info!("Set {} MTU to {}", interface, mtu);
        Ok(())
    }

    /// `ipconfig /flushdns`
    pub fn flush_dns(&self) -> Result<()> {
        let args = vec!["/flushdns".to_string()];
        let output = self.runner.run(IPCONFIG, &args, self.timeout)?;
        if !output.success() {
            return Err(command_failed(IPCONFIG, &args, &output));
        }
        log::info!("Flushed DNS resolver cache");
        Ok(())
    }

    fn netsh(&self, args: &[String]) -> Result<CommandOutput> {
        log::debug!("Running {}", render_command(NETSH, args));
        let output = self.runner.run(NETSH, args, self.timeout)?;
        if !output.success() {
            return Err(command_failed(NETSH, args, &output));
        }
        Ok(output)
    }
}

fn check_netmask(mask: Ipv4Addr) -> Result<u8> {
    ipnet::ipv4_mask_to_prefix(mask)
        .map_err(|_| Error::InvalidArgument(format!("{} is not a contiguous netmask", mask)))
}

fn command_failed(program: &str, args: &[String], output: &CommandOutput) -> Error {
    Error::CommandFailed {
        command: render_command(program, args),
        code: output.status,
        output: output.message().to_string(),
    }
}

fn render_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn quoted(interface: &str) -> String {
    format!("\"{}\"", interface)
}

fn set_address_args(interface: &str, address: Ipv4Addr, mask: Ipv4Addr) -> Vec<String> {
    vec![
        "interface".into(),
        "ip".into(),
        "set".into(),
        "address".into(),
        format!("name={}", quoted(interface)),
        "static".into(),
        address.to_string(),
        mask.to_string(),
    ]
}

fn set_dns_args(interface: &str, server: Ipv4Addr) -> Vec<String> {
    vec![
        "interface".into(),
        "ip".into(),
        "set".into(),
        "dns".into(),
        format!("name={}", quoted(interface)),
        "static".into(),
        server.to_string(),
    ]
}

fn add_route_args(
    interface: &str,
    destination: Ipv4Addr,
    prefix: u8,
    gateway: Ipv4Addr,
    metric: u32,
) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv4".into(),
        "add".into(),
        "route".into(),
        format!("{}/{}", destination, prefix),
        quoted(interface),
        gateway.to_string(),
        format!("metric={}", metric),
    ]
}

fn set_metric_args(interface: &str, metric: u32) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv4".into(),
        "set".into(),
        "interface".into(),
        quoted(interface),
        format!("metric={}", metric),
    ]
}

fn set_mtu_args(interface: &str, mtu: u32) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv4".into(),
        "set".into(),
        "subinterface".into(),
        quoted(interface),
        format!("mtu={}", mtu),
        "store=persistent".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingRunner;

    fn configurator() -> (Arc<RecordingRunner>, NetshConfigurator) {
        let runner = Arc::new(RecordingRunner::new());
        let netcfg = NetshConfigurator::with_runner(runner.clone());
        (runner, netcfg)
    }

    #[test]
    fn test_set_ip_address_grammar() {
        let (runner, netcfg) = configurator();
        netcfg
            .set_ip_address("ruhop", Ipv4Addr::new(10, 66, 0, 2), Ipv4Addr::new(255, 255, 255, 0))
            .unwrap();
        assert_eq!(
            runner.command_lines(),
            vec!["netsh interface ip set address name=\"ruhop\" static 10.66.0.2 255.255.255.0"]
        );
    }

    #[test]
    fn test_set_ip_address_rejects_bad_mask() {
        let (runner, netcfg) = configurator();
        let err = netcfg
            .set_ip_address("ruhop", Ipv4Addr::new(10, 66, 0, 2), Ipv4Addr::new(255, 0, 255, 0))
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_set_dns_grammar() {
        let (runner, netcfg) = configurator();
        netcfg.set_dns_server("ruhop", Ipv4Addr::new(10, 66, 0, 1)).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec!["netsh interface ip set dns name=\"ruhop\" static 10.66.0.1"]
        );
    }

    #[test]
    fn test_add_route_grammar() {
        let (runner, netcfg) = configurator();
        netcfg
            .add_route(
                "ruhop",
                Ipv4Addr::new(0, 0, 0, 0),
                Ipv4Addr::new(128, 0, 0, 0),
                Ipv4Addr::new(10, 66, 0, 1),
                1,
            )
            .unwrap();
        assert_eq!(
            runner.command_lines(),
            vec!["netsh interface ipv4 add route 0.0.0.0/1 \"ruhop\" 10.66.0.1 metric=1"]
        );
    }

    #[test]
    fn test_add_route_already_exists_is_success() {
        let (runner, netcfg) = configurator();
        runner.push_output(CommandOutput::failed(1, "The object already exists."));
        netcfg
            .add_route(
                "ruhop",
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(255, 0, 0, 0),
                Ipv4Addr::new(10, 66, 0, 1),
                5,
            )
            .unwrap();
    }

    #[test]
    fn test_add_route_other_failure_surfaces() {
        let (runner, netcfg) = configurator();
        runner.push_output(CommandOutput::failed(1, "Element not found."));
        let err = netcfg
            .add_route(
                "ruhop",
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(255, 0, 0, 0),
                Ipv4Addr::new(10, 66, 0, 1),
                5,
            )
            .unwrap_err();
        match err {
            Error::CommandFailed { code, output, .. } => {
                assert_eq!(code, Some(1));
                assert_eq!(output, "Element not found.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_set_mtu_range() {
        let (runner, netcfg) = configurator();
        assert!(netcfg.set_mtu("ruhop", 500).unwrap_err().is_precondition());
        assert!(netcfg.set_mtu("ruhop", 9500).unwrap_err().is_precondition());
        assert!(runner.commands().is_empty());

        netcfg.set_mtu("ruhop", 1400).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec!["netsh interface ipv4 set subinterface \"ruhop\" mtu=1400 store=persistent"]
        );
    }

    #[test]
    fn test_set_metric_grammar() {
        let (runner, netcfg) = configurator();
        netcfg.set_interface_metric("ruhop", 5).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec!["netsh interface ipv4 set interface \"ruhop\" metric=5"]
        );
    }

    #[test]
    fn test_flush_dns() {
        let (runner, netcfg) = configurator();
        netcfg.flush_dns().unwrap();
        assert_eq!(runner.command_lines(), vec!["ipconfig /flushdns"]);
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let (runner, netcfg) = configurator();
        runner.push_output(CommandOutput::failed(1, "The parameter is incorrect."));
        let err = netcfg.set_interface_metric("ruhop", 5).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { code: Some(1), .. }));
    }

    #[test]
    fn test_timeout_is_passed_to_runner() {
        let (runner, netcfg) = configurator();
        let netcfg = netcfg.timeout(Duration::from_secs(2));
        netcfg.flush_dns().unwrap();
        assert_eq!(runner.commands()[0].timeout, Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_captures_output() {
        let output = SystemRunner
            .run("sh", &["-c".into(), "echo hello; exit 3".into()], Duration::from_secs(5))
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_times_out() {
        let err = SystemRunner
            .run("sleep", &["5".into()], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_drains_large_output() {
        let script = "head -c 200000 /dev/zero; head -c 100000 /dev/zero >&2; echo done";
        let output = SystemRunner
            .run("sh", &["-c".into(), script.into()], Duration::from_secs(10))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.len(), 200_005);
        assert!(output.stdout.ends_with("done\n"));
        assert_eq!(output.stderr.len(), 100_000);
    }

    #[test]
    fn test_interface_name_with_space_is_quoted() {
        let (runner, netcfg) = configurator();
        netcfg.set_interface_metric("Ruhop VPN", 5).unwrap();
        netcfg
            .set_dns_server("Ruhop VPN", Ipv4Addr::new(10, 66, 0, 1))
            .unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![
                "netsh interface ipv4 set interface \"Ruhop VPN\" metric=5",
                "netsh interface ip set dns name=\"Ruhop VPN\" static 10.66.0.1",
            ]
        );
    }
}

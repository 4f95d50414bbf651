//! Fakes for the external collaborators: tools, master downloads, metrics.
//!
//! `FakeTools` behaves like just enough of easy-rsa, openssl and tar to drive
//! the control plane end to end against a scratch directory.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use vpn_control_plane::registry;
use vpn_control_plane::replication::{ArchiveFetcher, ArchiveKind};
use vpn_control_plane::tool::{BoxFuture, CommandOutput, CommandRunner, CommandSpec};
use vpn_control_plane::{ControlPlaneError, MetricsSink};

/// Expiry written for certificates issued by the fake easy-rsa.
pub const ISSUED_EXPIRY: &str = "350101000000Z";

/// What `openssl x509 -enddate` prints for the CA.
pub const CA_ENDDATE: &str = "notAfter=Jan  2 15:04:05 2034 GMT";

/// Contents of the file written into a directory on extraction.
pub const EXTRACT_MARKER: &str = ".restored";

// =============================================================================
// FakeTools
// =============================================================================

/// Scripted easy-rsa, openssl and tar.
#[derive(Default)]
pub struct FakeTools {
    calls: Mutex<Vec<CommandSpec>>,
    /// Subcommands (`build-client-full`, `gen-crl`, `-xzf`, ...) that exit 1.
    failing: Mutex<HashSet<String>>,
    serial: AtomicUsize,
}

impl FakeTools {
    pub fn fail(&self, subcommand: &str) {
        self.failing.lock().unwrap().insert(subcommand.to_string());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose argument list contains `needle`.
    pub fn calls_with(&self, needle: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|spec| spec.args.iter().any(|a| a == needle))
            .collect()
    }

    fn subcommand(spec: &CommandSpec) -> Option<&str> {
        match spec.program.as_str() {
            "easyrsa" => spec.args.get(1).map(String::as_str),
            _ => spec.args.first().map(String::as_str),
        }
    }

    fn handle(&self, spec: &CommandSpec) -> CommandOutput {
        match spec.program.as_str() {
            "easyrsa" => self.easyrsa(spec),
            "openssl" => ok(CA_ENDDATE),
            "tar" => tar(spec),
            other => failed(&format!("{}: command not found", other)),
        }
    }

    fn easyrsa(&self, spec: &CommandSpec) -> CommandOutput {
        let pki = spec.cwd.clone().unwrap_or_default().join("pki");
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["--batch", "build-client-full", identity, "nopass"] => {
                let n = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
                let serial = format!("{:02X}", n);
                issue(&pki, identity, &serial);
                ok("")
            }
            ["--batch", "revoke", identity] => revoke(&pki, identity),
            ["--batch", "gen-crl"] => {
                write(&pki.join("crl.pem"), "CRL");
                ok("")
            }
            _ => failed(&format!("unexpected easyrsa args {:?}", args)),
        }
    }
}

impl CommandRunner for FakeTools {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, CommandOutput> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(spec.clone());
            let failing = Self::subcommand(spec)
                .map(|sub| self.failing.lock().unwrap().contains(sub))
                .unwrap_or(false);
            if failing {
                return Ok(failed("scripted failure"));
            }
            Ok(self.handle(spec))
        })
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn issue(pki: &Path, identity: &str, serial: &str) {
    let index = pki.join("index.txt");
    let mut text = std::fs::read_to_string(&index).unwrap_or_default();
    text.push_str(&super::valid_line(identity, ISSUED_EXPIRY, serial));
    write(&index, &text);

    if !pki.join("ca.crt").exists() {
        write(&pki.join("ca.crt"), "CA CERT\n");
    }
    write(&pki.join("issued").join(format!("{}.crt", identity)), &format!("CERT {}\n", identity));
    write(&pki.join("private").join(format!("{}.key", identity)), &format!("KEY {}\n", identity));
    write(&pki.join("reqs").join(format!("{}.req", identity)), &format!("REQ {}\n", identity));
}

fn revoke(pki: &Path, identity: &str) -> CommandOutput {
    let index = pki.join("index.txt");
    let mut records = registry::parse(&std::fs::read_to_string(&index).unwrap_or_default());
    let Some(record) = records
        .iter_mut()
        .find(|r| r.identity == identity && r.state == vpn_control_plane::CertState::Valid)
    else {
        return failed("Unable to revoke as no certificate was found");
    };
    record.revoke(Utc::now());
    let serial = record.serial_number.clone();
    write(&index, &registry::render(&records));

    let moves = [
        (
            pki.join("issued").join(format!("{}.crt", identity)),
            pki.join("revoked").join("certs_by_serial").join(format!("{}.crt", serial)),
        ),
        (
            pki.join("private").join(format!("{}.key", identity)),
            pki.join("revoked").join("private_by_serial").join(format!("{}.key", serial)),
        ),
        (
            pki.join("reqs").join(format!("{}.req", identity)),
            pki.join("revoked").join("reqs_by_serial").join(format!("{}.req", serial)),
        ),
    ];
    for (from, to) in moves {
        if let Ok(contents) = std::fs::read_to_string(&from) {
            write(&to, &contents);
            let _ = std::fs::remove_file(&from);
        }
    }
    ok("")
}

/// `-czf ARCHIVE -C SRC .` writes a marker naming SRC;
/// `-xzf ARCHIVE -C DEST` copies the archive bytes to `DEST/.restored`.
fn tar(spec: &CommandSpec) -> CommandOutput {
    let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["-czf", archive, "-C", source, "."] => {
            write(Path::new(archive), &format!("TARBALL {}", source));
            ok("")
        }
        ["-xzf", archive, "-C", dest] => match std::fs::read(archive) {
            Ok(bytes) => {
                std::fs::write(PathBuf::from(dest).join(EXTRACT_MARKER), bytes).unwrap();
                ok("")
            }
            Err(e) => failed(&format!("tar: {}: {}", archive, e)),
        },
        _ => failed(&format!("unexpected tar args {:?}", args)),
    }
}

// =============================================================================
// ScriptedFetcher
// =============================================================================

/// Answers archive downloads from per-archive queues.
///
/// An empty queue answers with an "unreachable" error.
#[derive(Default)]
pub struct ScriptedFetcher {
    replies: Mutex<HashMap<ArchiveKind, VecDeque<Result<Vec<u8>, String>>>>,
    calls: Mutex<HashMap<ArchiveKind, usize>>,
}

impl ScriptedFetcher {
    pub fn push_ok(&self, kind: ArchiveKind, bytes: &[u8]) {
        self.replies
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(Ok(bytes.to_vec()));
    }

    pub fn push_err(&self, kind: ArchiveKind, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn calls(&self, kind: ArchiveKind) -> usize {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }
}

impl ArchiveFetcher for ScriptedFetcher {
    fn fetch(&self, kind: ArchiveKind) -> BoxFuture<'_, Vec<u8>> {
        Box::pin(async move {
            *self.calls.lock().unwrap().entry(kind).or_default() += 1;
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get_mut(&kind)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err("master unreachable".to_string()));
            reply.map_err(|message| ControlPlaneError::replication(kind.file_name(), message))
        })
    }
}

// =============================================================================
// RecordingSink
// =============================================================================

/// One recorded gauge write.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeWrite {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Records every gauge write for assertions.
#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<GaugeWrite>>,
}

impl RecordingSink {
    pub fn writes(&self) -> Vec<GaugeWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// Latest value of an unlabeled gauge.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.writes()
            .into_iter()
            .rev()
            .find(|w| w.name == name && w.labels.is_empty())
            .map(|w| w.value)
    }

    /// Latest value of the series carrying `key=value`.
    pub fn labeled(&self, name: &str, key: &str, value: &str) -> Option<f64> {
        self.writes()
            .into_iter()
            .rev()
            .find(|w| w.name == name && w.labels.iter().any(|(k, v)| k == key && v == value))
            .map(|w| w.value)
    }
}

impl MetricsSink for RecordingSink {
    fn set_gauge(&self, name: &'static str, value: f64) {
        self.writes.lock().unwrap().push(GaugeWrite {
            name: name.to_string(),
            labels: Vec::new(),
            value,
        });
    }

    fn set_labeled_gauge(&self, name: &'static str, labels: &[(&'static str, String)], value: f64) {
        self.writes.lock().unwrap().push(GaugeWrite {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            value,
        });
    }
}

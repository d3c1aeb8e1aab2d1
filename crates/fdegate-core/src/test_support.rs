//! Hand-written mock providers shared by the unit tests.

use fdegate_provider::{
    CommandOutput, CommandRunner, NewSecretItem, PrincipalResolver, TrustStore, TrustedPrincipal,
};
use plist::{Dictionary, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

/// Answers by first argument; the last scripted answer for a subcommand repeats.
#[derive(Clone, Default)]
pub(crate) struct ScriptedRunner {
    responses: Arc<Mutex<HashMap<String, VecDeque<CommandOutput>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, subcommand: &str, status: i32, stdout: &[u8]) {
        self.respond_with_stderr(subcommand, status, stdout, b"");
    }

    pub fn respond_with_stderr(&self, subcommand: &str, status: i32, stdout: &[u8], stderr: &[u8]) {
        self.responses
            .lock()
            .unwrap()
            .entry(subcommand.to_string())
            .or_default()
            .push_back(CommandOutput {
                status,
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn invoked(&self, subcommand: &str) -> bool {
        self.calls()
            .iter()
            .any(|call| call.args.first().map(String::as_str) == Some(subcommand))
    }
}

impl CommandRunner for ScriptedRunner {
    type Error = io::Error;

    fn run(
        &self,
        program: &Path,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Self::Error> {
        self.calls.lock().unwrap().push(Call {
            program: program.to_path_buf(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        let key = args.first().copied().unwrap_or_default();
        let mut responses = self.responses.lock().unwrap();
        let Some(queue) = responses.get_mut(key) else {
            return Ok(CommandOutput {
                status: 127,
                stdout: Vec::new(),
                stderr: format!("unscripted subcommand {key}").into_bytes(),
            });
        };
        let output = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        output.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "empty script"))
    }
}

/// Runner whose every invocation fails to start.
#[derive(Clone, Copy, Default)]
pub(crate) struct FailingRunner;

impl CommandRunner for FailingRunner {
    type Error = io::Error;

    fn run(
        &self,
        program: &Path,
        _args: &[&str],
        _stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Self::Error> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found", program.display()),
        ))
    }
}

/// XML output document carrying `key` as the recovery key.
pub(crate) fn recovery_plist(key: &str) -> Vec<u8> {
    let mut dict = Dictionary::new();
    dict.insert("RecoveryKey".into(), Value::String(key.into()));
    dict.insert("EnabledUser".into(), Value::String("alice".into()));
    let mut buf = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut buf).unwrap();
    buf
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    pub items: HashMap<String, NewSecretItem>,
    pub adds: usize,
    pub deletes: usize,
    pub fail_lookup: bool,
    pub fail_add: bool,
    pub fail_delete: bool,
}

/// Keychain double keyed by label.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    pub state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(&self, apply: impl FnOnce(&mut StoreState)) {
        apply(&mut self.state.lock().unwrap());
    }

    pub fn item(&self, label: &str) -> Option<NewSecretItem> {
        self.state.lock().unwrap().items.get(label).cloned()
    }

    pub fn seed(&self, label: &str, value: &str) {
        let item = NewSecretItem {
            label: label.into(),
            value: value.into(),
            comment: String::new(),
            description: String::new(),
            invisible: false,
            service: String::new(),
            account: String::new(),
            access: None,
        };
        self.state.lock().unwrap().items.insert(label.into(), item);
    }
}

impl TrustStore for MemoryStore {
    type Error = io::Error;

    fn find_secret(
        &self,
        _keychain: Option<&Path>,
        label: &str,
    ) -> Result<Option<String>, Self::Error> {
        let state = self.state.lock().unwrap();
        if state.fail_lookup {
            return Err(io::Error::new(io::ErrorKind::Other, "keychain locked"));
        }
        Ok(state.items.get(label).map(|item| item.value.clone()))
    }

    fn delete_secret(&self, _keychain: &Path, label: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete {
            return Err(io::Error::new(io::ErrorKind::Other, "delete refused"));
        }
        state.deletes += 1;
        state.items.remove(label);
        Ok(())
    }

    fn add_secret(&self, _keychain: &Path, item: &NewSecretItem) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_add {
            return Err(io::Error::new(io::ErrorKind::Other, "add refused"));
        }
        if state.items.contains_key(&item.label) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "duplicate item"));
        }
        state.adds += 1;
        state.items.insert(item.label.clone(), item.clone());
        Ok(())
    }
}

/// Resolves every path except the ones marked missing; identity is the path
/// bytes, or `self:` for the calling binary.
#[derive(Clone, Default)]
pub(crate) struct StaticResolver {
    missing: HashSet<String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing(mut self, path: &str) -> Self {
        self.missing.insert(path.to_string());
        self
    }
}

impl PrincipalResolver for StaticResolver {
    type Error = io::Error;

    fn resolve(&self, path: &str) -> Result<TrustedPrincipal, Self::Error> {
        if self.missing.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()));
        }
        let shown = if path.is_empty() { "/usr/libexec/self" } else { path };
        Ok(TrustedPrincipal {
            path: shown.to_string(),
            identity: format!("id:{shown}").into_bytes(),
        })
    }
}

pub(crate) fn principal(path: &str) -> TrustedPrincipal {
    TrustedPrincipal {
        path: path.to_string(),
        identity: format!("id:{path}").into_bytes(),
    }
}

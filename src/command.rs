//! Command Classification
//!
//! Built-in commands (monitors, pub/sub, cluster and secret administration)
//! are implemented in-process; anything else must be known to the backend.

use crate::error::{Error, Result};
use crate::protocol::{Action, Value};
use crate::storage::{Arity, Backend, CommandInfo};

/// Commands this node implements itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Ping,
    MAdd,
    MRem,
    EAdd,
    ERem,
    EMembers,
    ECard,
    Subscribe,
    Unsubscribe,
    Publish,
    ListenAdd,
    ListenRem,
    PullChanges,
    GlobalSecrets,
    SetGlobalSecrets,
    GetSecrets,
    SetSecrets,
    AddSecret,
    RemSecret,
}

impl Builtin {
    pub const ALL: [Builtin; 19] = [
        Builtin::Ping,
        Builtin::MAdd,
        Builtin::MRem,
        Builtin::EAdd,
        Builtin::ERem,
        Builtin::EMembers,
        Builtin::ECard,
        Builtin::Subscribe,
        Builtin::Unsubscribe,
        Builtin::Publish,
        Builtin::ListenAdd,
        Builtin::ListenRem,
        Builtin::PullChanges,
        Builtin::GlobalSecrets,
        Builtin::SetGlobalSecrets,
        Builtin::GetSecrets,
        Builtin::SetSecrets,
        Builtin::AddSecret,
        Builtin::RemSecret,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Ping => "PING",
            Builtin::MAdd => "MADD",
            Builtin::MRem => "MREM",
            Builtin::EAdd => "EADD",
            Builtin::ERem => "EREM",
            Builtin::EMembers => "EMEMBERS",
            Builtin::ECard => "ECARD",
            Builtin::Subscribe => "SUBSCRIBE",
            Builtin::Unsubscribe => "UNSUBSCRIBE",
            Builtin::Publish => "PUBLISH",
            Builtin::ListenAdd => "ALISTENADD",
            Builtin::ListenRem => "ALISTENREM",
            Builtin::PullChanges => "APULLCHANGES",
            Builtin::GlobalSecrets => "AGLOBALSECRETS",
            Builtin::SetGlobalSecrets => "ASETGLOBALSECRETS",
            Builtin::GetSecrets => "AGETSECRETS",
            Builtin::SetSecrets => "ASETSECRETS",
            Builtin::AddSecret => "AADDSECRET",
            Builtin::RemSecret => "AREMSECRET",
        }
    }

    /// Lookup by upper-case name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn info(&self) -> CommandInfo {
        use Arity::*;
        match self {
            Builtin::Ping => CommandInfo::read(Exact(0)),
            Builtin::MAdd | Builtin::MRem => CommandInfo::read(Exact(0)),
            Builtin::EAdd => CommandInfo::write(Exact(1)),
            Builtin::ERem => CommandInfo::write(Exact(0)),
            Builtin::EMembers | Builtin::ECard => CommandInfo::read(Exact(0)),
            Builtin::Subscribe | Builtin::Unsubscribe => CommandInfo::read(AtLeast(1)),
            Builtin::Publish => CommandInfo::read(Exact(2)),
            Builtin::ListenAdd | Builtin::ListenRem => CommandInfo::admin(Exact(1)),
            Builtin::PullChanges => CommandInfo::admin(Exact(0)),
            Builtin::GlobalSecrets => CommandInfo::admin(Exact(0)),
            Builtin::SetGlobalSecrets => CommandInfo::admin(AtLeast(1)),
            Builtin::GetSecrets => CommandInfo::admin(Exact(0)),
            Builtin::SetSecrets => CommandInfo::admin(AtLeast(0)),
            Builtin::AddSecret | Builtin::RemSecret => CommandInfo::admin(Exact(1)),
        }
    }
}

/// Where a command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Builtin(Builtin),
    /// Passed through to the backend via the pool
    Direct,
}

/// Result of classifying one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Normalized (upper-case) command name
    pub name: String,
    pub kind: CommandKind,
    pub info: CommandInfo,
}

/// Look the command up (built-ins first, then the backend) and check arity
pub fn classify(backend: &dyn Backend, action: &Action) -> Result<Classified> {
    let name = action.command.to_ascii_uppercase();

    let (kind, info) = match Builtin::from_name(&name) {
        Some(builtin) => (CommandKind::Builtin(builtin), builtin.info()),
        None => match backend.command_info(&name) {
            Some(info) => (CommandKind::Direct, info),
            None => return Err(Error::UnsupportedCommand(action.command.clone())),
        },
    };

    info.arity.check(&name, action.args.len())?;

    Ok(Classified { name, kind, info })
}

/// Reinterpret a flat `[k1, v1, k2, v2, ...]` reply as a map
pub fn list_to_map(value: Value) -> Result<Value> {
    match value {
        Value::List(items) => {
            if items.len() % 2 != 0 {
                return Err(Error::MalformedReply(format!(
                    "expected an even number of elements, got {}",
                    items.len()
                )));
            }
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                pairs.push((k, v));
            }
            Ok(Value::Map(pairs))
        }
        other => Ok(other),
    }
}

//! Runes: bearer tokens that can be narrowed but never widened.
//!
//! The scheduler derives one master rune per enrolment from its secret. The
//! master rune is bound to the node's public key and tagged with a unique
//! id, so recovering a node invalidates every rune carved from the previous
//! one. Holders may append restrictions ([`RuneFactory::carve`]) and hand
//! the narrower rune to less trusted callers; the scheduler checks the
//! authcode chain and every restriction against a [`RuneContext`] before
//! serving a request.

use nodesign_signer::NodeId;
use runeauth::{Alternative, Check, Condition, ConditionChecker, Restriction, Rune, RuneError};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::registry::RUNE_SECRET_LEN;

/// Why a presented rune was refused.
#[derive(Debug, Error)]
pub enum RuneCheckError {
    #[error("Malformed rune: {0}")]
    Malformed(String),

    #[error("Rune was not issued by this scheduler")]
    NotIssued,

    #[error("Rune restrictions not met: {0}")]
    Restricted(String),
}

/// Something that can be turned into rune restrictions.
pub trait Restrictor {
    fn generate(self) -> Result<Vec<Restriction>, RuneError>;
}

/// Carves narrower runes out of existing ones.
pub struct RuneFactory;

impl RuneFactory {
    /// Append the restrictions of every rule in `append` to `origin` and
    /// return the result in base64.
    pub fn carve<T: Restrictor + Copy>(origin: &Rune, append: &[T]) -> Result<String, RuneError> {
        let mut rune = origin.clone();
        for rule in append {
            for restriction in (*rule).generate()? {
                rune.add_restriction(restriction);
            }
        }
        Ok(rune.to_base64())
    }
}

/// Predefined restriction sets.
#[derive(Debug, Clone, Copy)]
pub enum DefRules<'a> {
    /// Only methods starting with `Get` or `List`
    ReadOnly,
    /// Only the `pay` method
    Pay,
    /// Any of the given rule sets, as one disjunction
    Add(&'a [DefRules<'a>]),
}

impl Restrictor for DefRules<'_> {
    fn generate(self) -> Result<Vec<Restriction>, RuneError> {
        Ok(vec![Restriction::new(self.alternatives()?)?])
    }
}

impl DefRules<'_> {
    fn alternatives(self) -> Result<Vec<Alternative>, RuneError> {
        match self {
            DefRules::ReadOnly => Ok(vec![
                alternative("method", Condition::BeginsWith, "Get")?,
                alternative("method", Condition::BeginsWith, "List")?,
            ]),
            DefRules::Pay => Ok(vec![alternative("method", Condition::Equal, "pay")?]),
            DefRules::Add(rules) => {
                let mut alternatives = Vec::new();
                for rule in rules {
                    alternatives.extend((*rule).alternatives()?);
                }
                Ok(alternatives)
            }
        }
    }
}

impl fmt::Display for DefRules<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefRules::ReadOnly => write!(f, "readonly"),
            DefRules::Pay => write!(f, "pay"),
            DefRules::Add(rules) => {
                for (i, rule) in rules.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{}", rule)?;
                }
                Ok(())
            }
        }
    }
}

fn alternative(field: &str, cond: Condition, value: &str) -> Result<Alternative, RuneError> {
    Alternative::new(field.to_string(), cond, value.to_string(), false)
}

/// Request attributes a rune's restrictions are checked against.
#[derive(Debug, Clone)]
pub struct RuneContext {
    /// Name of the requested method, e.g. `Schedule`
    pub method: String,
    /// Hex node id the request acts for
    pub pubkey: String,
    /// Unique id of the node's current master rune
    pub unique_id: String,
    pub time: SystemTime,
}

impl RuneContext {
    pub fn new(method: impl Into<String>, node_id: &NodeId, unique_id: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            pubkey: node_id.to_hex(),
            unique_id: unique_id.into(),
            time: SystemTime::now(),
        }
    }
}

impl Check for RuneContext {
    fn check_alternative(&self, alt: &Alternative) -> Result<(), RuneError> {
        let value = match alt.get_field().as_str() {
            "" => self.unique_id.clone(),
            "method" => self.method.clone(),
            "pubkey" => self.pubkey.clone(),
            "time" => self
                .time
                .duration_since(UNIX_EPOCH)
                .map_err(|e| RuneError::Unknown(format!("Invalid request time: {:?}", e)))?
                .as_secs()
                .to_string(),
            // Unknown fields only satisfy "missing" conditions.
            _ => String::new(),
        };
        ConditionChecker { value }.check_alternative(alt)
    }
}

/// Issues and checks the master runes of one scheduler.
pub struct RuneIssuer {
    secret: Zeroizing<[u8; RUNE_SECRET_LEN]>,
    root: Rune,
}

impl RuneIssuer {
    pub fn new(secret: &[u8; RUNE_SECRET_LEN]) -> Result<Self, RuneError> {
        let secret = Zeroizing::new(*secret);
        let root = Rune::new_master_rune(&*secret, vec![], None, None)?;
        Ok(Self { secret, root })
    }

    /// Master rune for `node_id`, restricted to that node and tagged with
    /// `unique_id`.
    pub fn issue(&self, node_id: &NodeId, unique_id: &str) -> Result<Rune, RuneError> {
        let pubkey = Restriction::new(vec![alternative(
            "pubkey",
            Condition::Equal,
            &node_id.to_hex(),
        )?])?;
        Rune::new_master_rune(&*self.secret, vec![pubkey], Some(unique_id.to_string()), None)
    }

    /// Check that `rune` descends from this scheduler's secret and that all
    /// of its restrictions hold for `context`.
    pub fn verify(&self, rune: &str, context: RuneContext) -> Result<(), RuneCheckError> {
        let rune =
            Rune::from_base64(rune).map_err(|e| RuneCheckError::Malformed(format!("{:?}", e)))?;
        if !self.root.is_authorized(&rune) {
            return Err(RuneCheckError::NotIssued);
        }
        rune.are_restrictions_met(context)
            .map_err(|e| RuneCheckError::Restricted(format!("{:?}", e)))
    }
}

/// Whether `rune` parses as a rune at all.
pub fn is_well_formed(rune: &str) -> bool {
    !rune.is_empty() && Rune::from_base64(rune).is_ok()
}

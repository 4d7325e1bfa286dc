//! Parameterised spending-script templates for programmable accounts.
//!
//! A template is a list of assembly tokens:
//!
//! - `OP_*` opcodes (`OP_0`..`OP_16`, `OP_TRUE` and `OP_FALSE` are accepted as
//!   small-integer aliases)
//! - `#<decimal>` script numbers
//! - `$<name>` placeholders bound at compile time from constructor arguments
//! - anything else is pushed as hex data
//!
//! The compiled script is used as a P2WSH witness script.

use std::collections::BTreeMap;

use elements::bitcoin::PublicKey;
use elements::opcodes::All as Opcode;
use elements::script::Builder;
use elements::Script;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    PublicKey,
    Bytes,
    Number,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParam {
    pub name: String,
    pub kind: ParamKind,
}

/// A bound constructor argument. Byte-like values travel as hex strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Number(i64),
    Hex(String),
}

impl ArgValue {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        ArgValue::Hex(hex::encode(bytes))
    }
}

pub type Arguments = BTreeMap<String, ArgValue>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTemplate {
    pub name: String,
    pub parameters: Vec<TemplateParam>,
    pub asm: Vec<String>,
}

impl ScriptTemplate {
    pub fn new(name: impl Into<String>, parameters: Vec<TemplateParam>, asm: &str) -> Self {
        Self {
            name: name.into(),
            parameters,
            asm: asm.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&TemplateParam> {
        self.parameters.iter().find(|param| param.name == name)
    }

    /// Substitute `arguments` into the template and assemble the script.
    pub fn compile(&self, arguments: &Arguments) -> Result<Script, WalletError> {
        for param in &self.parameters {
            let value = arguments
                .get(&param.name)
                .ok_or_else(|| WalletError::MissingArgument {
                    template: self.name.clone(),
                    argument: param.name.clone(),
                })?;
            check_kind(&self.name, param, value)?;
        }

        let mut builder = Builder::new();
        for token in &self.asm {
            builder = self.push_token(builder, token, arguments)?;
        }
        Ok(builder.into_script())
    }

    fn push_token(
        &self,
        builder: Builder,
        token: &str,
        arguments: &Arguments,
    ) -> Result<Builder, WalletError> {
        if let Some(name) = token.strip_prefix('$') {
            if self.parameter(name).is_none() {
                return Err(WalletError::Template(format!(
                    "{}: placeholder ${name} is not a declared parameter",
                    self.name
                )));
            }
            let value = arguments
                .get(name)
                .ok_or_else(|| WalletError::MissingArgument {
                    template: self.name.clone(),
                    argument: name.to_string(),
                })?;
            return Ok(match value {
                ArgValue::Number(n) => builder.push_int(*n),
                ArgValue::Hex(hex) => builder.push_slice(&decode_hex(&self.name, name, hex)?),
            });
        }
        if let Some(number) = token.strip_prefix('#') {
            let n: i64 = number.parse().map_err(|_| {
                WalletError::Template(format!("{}: invalid number token {token}", self.name))
            })?;
            return Ok(builder.push_int(n));
        }
        if token.starts_with("OP_") {
            if let Some(n) = small_int_alias(token) {
                return Ok(builder.push_int(n));
            }
            let opcode = lookup_opcode(token).ok_or_else(|| {
                WalletError::Template(format!("{}: unknown opcode {token}", self.name))
            })?;
            return Ok(builder.push_opcode(opcode));
        }
        let data = hex::decode(token).map_err(|_| {
            WalletError::Template(format!("{}: invalid token {token}", self.name))
        })?;
        Ok(builder.push_slice(&data))
    }
}

fn check_kind(template: &str, param: &TemplateParam, value: &ArgValue) -> Result<(), WalletError> {
    match (param.kind, value) {
        (ParamKind::Number, ArgValue::Number(_)) => Ok(()),
        (ParamKind::Bytes, ArgValue::Hex(hex)) => decode_hex(template, &param.name, hex).map(|_| ()),
        (ParamKind::PublicKey, ArgValue::Hex(hex)) => {
            let bytes = decode_hex(template, &param.name, hex)?;
            PublicKey::from_slice(&bytes).map(|_| ()).map_err(|err| {
                WalletError::Template(format!(
                    "{template}: argument {} is not a public key: {err}",
                    param.name
                ))
            })
        }
        _ => Err(WalletError::Template(format!(
            "{template}: argument {} does not match kind {:?}",
            param.name, param.kind
        ))),
    }
}

fn decode_hex(template: &str, name: &str, hex: &str) -> Result<Vec<u8>, WalletError> {
    hex::decode(hex).map_err(|err| {
        WalletError::Template(format!("{template}: argument {name} is not hex: {err}"))
    })
}

fn small_int_alias(token: &str) -> Option<i64> {
    match token {
        "OP_0" | "OP_FALSE" => Some(0),
        "OP_TRUE" => Some(1),
        _ => {
            let n: i64 = token.strip_prefix("OP_")?.parse().ok()?;
            (1..=16).contains(&n).then_some(n)
        }
    }
}

fn lookup_opcode(token: &str) -> Option<Opcode> {
    let token = match token {
        "OP_CHECKLOCKTIMEVERIFY" => "OP_CLTV",
        "OP_CHECKSEQUENCEVERIFY" => "OP_CSV",
        other => other,
    };
    (0..=u8::MAX)
        .map(Opcode::from)
        .find(|opcode| format!("{opcode:?}") == token)
}

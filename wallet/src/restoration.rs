//! Restoration file: enough data to rebuild every programmable script entry
//! of an account without the template author.
//!
//! ```json
//! {
//!   "liquid": [
//!     {
//!       "accountName": "vault",
//!       "templatesByName": { "timelocked": { "name": "timelocked", ... } },
//!       "pathToBoundArguments": {
//!         "m/84'/1776'/1'/0/0": { "templateName": "timelocked", "arguments": { ... } }
//!       }
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;

use elements::Script;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::keys::{parse_chain_index, AccountDetails, BoundTemplate, ScriptDetails};
use crate::network::Network;
use crate::store::WalletRepository;
use crate::template::{Arguments, ScriptTemplate};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundArguments {
    pub template_name: String,
    pub arguments: Arguments,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorationRecord {
    pub account_name: String,
    pub templates_by_name: BTreeMap<String, ScriptTemplate>,
    pub path_to_bound_arguments: BTreeMap<String, BoundArguments>,
}

pub type RestorationFile = BTreeMap<Network, Vec<RestorationRecord>>;

impl RestorationRecord {
    /// Rebuild the script entries described by this record. Arguments are
    /// taken as recorded; nothing is re-derived from the master key.
    pub fn script_entries(
        &self,
        account: &AccountDetails,
        network: Network,
    ) -> Result<Vec<(Script, ScriptDetails)>, WalletError> {
        if !account.kind.is_programmable() {
            return Err(WalletError::UnsupportedAccountKind(account.name.clone()));
        }
        let blinding = account.master_blinding_key();
        self.path_to_bound_arguments
            .iter()
            .map(|(path, bound)| {
                let (chain, index) = parse_chain_index(path)?;
                let template = self
                    .templates_by_name
                    .get(&bound.template_name)
                    .cloned()
                    .ok_or_else(|| {
                        WalletError::Template(format!(
                            "{path} refers to unknown template {}",
                            bound.template_name
                        ))
                    })?;
                let bound = BoundTemplate {
                    template,
                    arguments: bound.arguments.clone(),
                };
                let script = bound.script_pubkey(network)?;
                let details = ScriptDetails {
                    account_name: self.account_name.clone(),
                    derivation_path: path.clone(),
                    chain,
                    index,
                    networks: vec![network],
                    blinding_private_key: hex::encode(
                        blinding.blinding_private_key(&script).secret_bytes(),
                    ),
                    template: Some(bound),
                };
                Ok((script, details))
            })
            .collect()
    }
}

/// Walk the programmable script entries of `account_name` on `network`.
pub fn export_restoration(
    store: &dyn WalletRepository,
    network: Network,
    account_name: &str,
) -> Result<RestorationRecord, WalletError> {
    let account = store.get_account_details(account_name)?;
    if !account.kind.is_programmable() {
        return Err(WalletError::UnsupportedAccountKind(account.name));
    }
    let mut record = RestorationRecord {
        account_name: account.name.clone(),
        ..Default::default()
    };
    for details in store
        .get_account_scripts(network, Some(account_name))?
        .into_values()
    {
        let Some(bound) = details.template else {
            continue;
        };
        record.path_to_bound_arguments.insert(
            details.derivation_path,
            BoundArguments {
                template_name: bound.template.name.clone(),
                arguments: bound.arguments,
            },
        );
        record
            .templates_by_name
            .insert(bound.template.name.clone(), bound.template);
    }
    Ok(record)
}

/// Export every programmable account on every network it has scripts on.
pub fn export_restoration_file(store: &dyn WalletRepository) -> Result<RestorationFile, WalletError> {
    let mut file = RestorationFile::new();
    for account in store.list_accounts()? {
        if !account.kind.is_programmable() {
            continue;
        }
        for network in &account.networks {
            let record = export_restoration(store, *network, &account.name)?;
            if !record.path_to_bound_arguments.is_empty() {
                file.entry(*network).or_default().push(record);
            }
        }
    }
    Ok(file)
}

pub fn parse_restoration_file(json: &str) -> Result<RestorationFile, WalletError> {
    Ok(serde_json::from_str(json)?)
}

//! `tollbridge login static`: print an ExecCredential for a static token,
//! optionally exchanging it with the concierge first.

use std::io::Write;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::cli::StaticLoginArgs;
use crate::concierge::{ConciergeClient, ConciergeSettings};
use crate::exec_credential::ExecCredential;

type LookupEnv = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Process-level dependencies of the command.
pub struct StaticLoginDeps {
    pub lookup_env: Box<LookupEnv>,
}

impl StaticLoginDeps {
    pub fn real() -> Self {
        Self {
            lookup_env: Box::new(|name| {
                std::env::var_os(name).map(|v| v.to_string_lossy().into_owned())
            }),
        }
    }
}

impl From<&StaticLoginArgs> for ConciergeSettings {
    fn from(args: &StaticLoginArgs) -> Self {
        Self {
            namespace: args.concierge_namespace.clone(),
            authenticator_type: args.concierge_authenticator_type.clone(),
            authenticator_name: args.concierge_authenticator_name.clone(),
            endpoint: args.concierge_endpoint.clone(),
            ca_bundle_data: args.concierge_ca_bundle_data.clone(),
            api_group_suffix: args.concierge_api_group_suffix.clone(),
        }
    }
}

pub async fn run(args: &StaticLoginArgs, deps: &StaticLoginDeps, out: &mut impl Write) -> Result<()> {
    if args.token.as_deref().unwrap_or_default().is_empty()
        && args.token_env.as_deref().unwrap_or_default().is_empty()
    {
        bail!("one of --token or --token-env must be set");
    }

    let concierge = if args.enable_concierge {
        let client = ConciergeClient::new(&ConciergeSettings::from(args))
            .context("invalid concierge parameters")?;
        Some(client)
    } else {
        None
    };

    let token = resolve_token(args, deps)?;

    let credential = match &concierge {
        Some(client) if args.concierge_use_impersonation_proxy => {
            tracing::debug!("Encoding token for the impersonation proxy");
            impersonation_proxy_credential(client, &token)?
        }
        Some(client) => client
            .exchange_token(&token)
            .await
            .context("could not complete concierge credential exchange")?,
        None => ExecCredential::from_token(token),
    };

    serde_json::to_writer(&mut *out, &credential).context("could not encode ExecCredential")?;
    writeln!(out)?;
    Ok(())
}

/// The token from `--token-env` when set, otherwise from `--token`.
fn resolve_token(args: &StaticLoginArgs, deps: &StaticLoginDeps) -> Result<String> {
    match args.token_env.as_deref().filter(|name| !name.is_empty()) {
        Some(name) => match (deps.lookup_env)(name) {
            None => bail!("--token-env variable \"{name}\" is not set"),
            Some(value) if value.is_empty() => bail!("--token-env variable \"{name}\" is empty"),
            Some(value) => Ok(value),
        },
        None => Ok(args.token.clone().unwrap_or_default()),
    }
}

/// Wraps the token in a `TokenCredentialRequest` that the impersonation proxy
/// unpacks from the bearer token.
fn impersonation_proxy_credential(client: &ConciergeClient, token: &str) -> Result<ExecCredential> {
    let request = serde_json::to_vec(&client.token_credential_request(token))
        .context("could not encode TokenCredentialRequest")?;
    Ok(ExecCredential::from_token(URL_SAFE_NO_PAD.encode(request)))
}

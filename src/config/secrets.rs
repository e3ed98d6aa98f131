// Credential list sourcing
//
// Credentials are pre-supplied by the environment as a single list value.
// Acquiring them from a secret store is the caller's job.

use anyhow::{anyhow, Result};

/// Split a raw credential list on commas, semicolons, and whitespace (including newlines)
pub fn parse_credential_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read and parse the credential list from environment variable `var`
pub fn credentials_from_env(var: &str) -> Result<Vec<String>> {
    let raw = std::env::var(var)
        .map_err(|e| anyhow!("Failed to read credentials from ${}: {}", var, e))?;

    let credentials = parse_credential_list(&raw);
    if credentials.is_empty() {
        return Err(anyhow!("${} does not contain any credentials", var));
    }

    log::info!("Loaded {} credentials from ${}", credentials.len(), var);
    Ok(credentials)
}

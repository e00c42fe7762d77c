use anyhow::{Context, Result, bail};
use std::io::{self, BufRead, Write};

use nutrilog_core::config::ProviderConfig;
use nutrilog_core::db::Database;
use nutrilog_core::models::now_millis;
use nutrilog_core::oauth::{PkcePair, authorization_url, random_state};

use crate::config::Config;
use crate::oauth::TokenClient;

/// Authorization code and state from whatever the user pasted: a bare code,
/// a query string, or the full redirect URL.
fn parse_pasted_code(input: &str) -> Result<(String, Option<String>)> {
    let input = input.trim();
    if input.is_empty() {
        bail!("No authorization code given");
    }
    if !input.contains("code=") {
        return Ok((input.to_string(), None));
    }

    let query = input.split_once('?').map_or(input, |(_, q)| q);
    let query = query.split_once('#').map_or(query, |(q, _)| q);
    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("code", v)) => code = Some(percent_decode(v)?),
            Some(("state", v)) => state = Some(percent_decode(v)?),
            Some(("error", v)) => bail!("Authorization was denied: {}", percent_decode(v)?),
            _ => {}
        }
    }
    let code = code
        .filter(|c| !c.is_empty())
        .context("No authorization code found in the pasted text")?;
    Ok((code, state))
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s
                    .get(i + 1..i + 3)
                    .context("Truncated percent escape in pasted text")?;
                let byte = u8::from_str_radix(hex, 16)
                    .with_context(|| format!("Invalid percent escape '%{hex}'"))?;
                out.push(byte);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).context("Pasted text is not valid UTF-8")
}

pub(crate) async fn cmd_auth_login(config: &Config, json: bool) -> Result<()> {
    let provider = ProviderConfig::from_env()?;
    let Some(oauth) = provider.oauth else {
        bail!(
            "Cloud login is not configured. Set NUTRILOG_OAUTH_CLIENT_ID and the NUTRILOG_OAUTH_* URLs"
        );
    };
    if provider.storage_url.is_none() {
        eprintln!("Note: NUTRILOG_STORAGE_URL is not set; sync keeps using the local backups directory");
    }

    let pkce = PkcePair::generate();
    let state = random_state();
    let url = authorization_url(&oauth, &pkce, &state);
    eprintln!("Open this URL in a browser and approve access:\n\n  {url}\n");
    eprint!("Paste the authorization code (or the redirect URL): ");
    io::stderr().flush()?;

    let line = io::stdin()
        .lock()
        .lines()
        .next()
        .context("No input")?
        .context("Failed to read authorization code")?;
    let (code, returned_state) = parse_pasted_code(&line)?;
    if returned_state.is_some_and(|s| s != state) {
        bail!("Authorization state mismatch; start `nutrilog auth login` again");
    }

    let client = TokenClient::new(oauth)?;
    let token = client.exchange(&code, &pkce.verifier).await?;
    config.token_store().save(&token)?;
    tracing::info!(user_id = %token.user_id, "connected cloud storage");

    if json {
        println!(
            "{}",
            serde_json::json!({ "user_id": token.user_id, "expires_at": token.expires_at })
        );
    } else {
        println!("Connected as {}", token.user_id);
    }
    Ok(())
}

pub(crate) fn cmd_auth_logout(db: &Database, config: &Config, json: bool) -> Result<()> {
    let removed = config.token_store().delete()?;
    if removed {
        db.set_auto_sync(false)?;
    }
    if json {
        println!("{}", serde_json::json!({ "logged_out": removed }));
    } else if removed {
        println!("Disconnected cloud storage; auto-sync is off");
    } else {
        println!("Not connected");
    }
    Ok(())
}

pub(crate) fn cmd_auth_status(config: &Config, json: bool) -> Result<()> {
    let provider = ProviderConfig::from_env()?;
    let token = config.token_store().load()?;
    let expired = token.as_ref().map(|t| t.is_expired_at(now_millis()));

    if json {
        println!(
            "{}",
            serde_json::json!({
                "storage_url": provider.storage_url,
                "login_configured": provider.oauth.is_some(),
                "connected": token.is_some(),
                "user_id": token.as_ref().map(|t| &t.user_id),
                "expires_at": token.as_ref().map(|t| t.expires_at),
                "expired": expired,
            })
        );
        return Ok(());
    }

    match &provider.storage_url {
        Some(url) => println!("Storage:   {url}"),
        None => println!(
            "Storage:   local directory {}",
            config.backups_dir.display()
        ),
    }
    match (&token, expired) {
        (Some(t), Some(true)) if provider.oauth.is_some() => {
            println!("Account:   {} (access token expired, refreshes on next sync)", t.user_id);
        }
        (Some(t), Some(true)) => println!("Account:   {} (session expired)", t.user_id),
        (Some(t), _) => println!("Account:   {}", t.user_id),
        (None, _) => println!("Account:   not connected"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_code() {
        assert_eq!(
            parse_pasted_code("  abc123\n").unwrap(),
            ("abc123".to_string(), None)
        );
    }

    #[test]
    fn test_parse_redirect_url() {
        let (code, state) =
            parse_pasted_code("https://app.example/cb?code=a%2Fb&state=xyz#frag").unwrap();
        assert_eq!(code, "a/b");
        assert_eq!(state.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_parse_query_string() {
        let (code, state) = parse_pasted_code("state=s1&code=c1").unwrap();
        assert_eq!(code, "c1");
        assert_eq!(state.as_deref(), Some("s1"));
    }

    #[test]
    fn test_parse_denied_and_empty() {
        let err = parse_pasted_code("https://app.example/cb?error=access_denied&code=").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
        assert!(parse_pasted_code("   ").is_err());
        assert!(parse_pasted_code("code=&state=x").is_err());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a+b%20c").unwrap(), "a b c");
        assert!(percent_decode("bad%2").is_err());
        assert!(percent_decode("bad%zz").is_err());
    }

    #[test]
    fn test_logout_turns_off_auto_sync() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().to_path_buf()).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.set_auto_sync(true).unwrap();
        config
            .token_store()
            .save(&nutrilog_core::oauth::StoredToken {
                user_id: "u1".to_string(),
                access_token: "tok".to_string(),
                expires_at: 0,
            })
            .unwrap();

        cmd_auth_logout(&db, &config, true).unwrap();
        assert!(!db.auto_sync_enabled().unwrap());
        assert!(config.token_store().load().unwrap().is_none());
    }
}

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::gcp::SecretStore;

pub const PASSWORD_LENGTH: usize = 12;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+[]{},.<>?;:";

/// Random password with at least one character of each class.
pub fn generate_password(length: usize) -> String {
    let classes = [LOWER, UPPER, DIGITS, SYMBOLS];
    let alphabet: Vec<u8> = classes.concat();
    let mut rng = rand::thread_rng();

    let mut password: Vec<u8> = classes
        .iter()
        .take(length)
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();
    while password.len() < length {
        password.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    password.shuffle(&mut rng);

    password.into_iter().map(char::from).collect()
}

/// Secret id holding the root password of `instance`.
pub fn secret_id(instance: &str) -> String {
    instance.to_uppercase()
}

/// Stores `password` as the only secret for `instance`, replacing any earlier one.
///
/// Returns the secret resource name.
pub async fn store_password(
    secrets: &dyn SecretStore,
    project: &str,
    instance: &str,
    replica_location: &str,
    password: &str,
) -> Result<String> {
    let id = secret_id(instance);

    match secrets.get_secret(project, &id).await {
        Ok(Some(existing)) => {
            info!(secret = %existing.name, "Replacing existing secret");
            secrets.delete_secret(&existing.name).await.map_err(|e| {
                error!(instance, error = %e, "Failed to delete secret");
                e
            })?;
        }
        Ok(None) => {}
        // A failed lookup falls through to create, which reports the real problem.
        Err(e) => error!(instance, error = %e, "Failed to get secret"),
    }

    let secret = secrets
        .create_secret(project, &id, replica_location)
        .await
        .map_err(|e| {
            error!(instance, error = %e, "Failed to create secret");
            e
        })?;
    secrets
        .add_secret_version(&secret.name, password.as_bytes())
        .await
        .map_err(|e| {
            error!(secret = %secret.name, error = %e, "Failed to add secret version");
            e
        })?;

    info!(secret = %secret.name, "Stored root password");
    Ok(secret.name)
}

/// Reads back the password stored by [`store_password`].
pub async fn load_password(
    secrets: &dyn SecretStore,
    project: &str,
    instance: &str,
) -> Result<(String, String)> {
    let id = secret_id(instance);
    let name = format!("projects/{project}/secrets/{id}");
    let payload = secrets
        .access_latest_version(project, &id)
        .await?
        .ok_or_else(|| Error::MissingCredential {
            secret: name.clone(),
        })?;
    let password = String::from_utf8(payload)
        .map_err(|e| Error::Remote(anyhow::anyhow!("secret {} is not UTF-8: {}", name, e)))?;
    Ok((name, password))
}

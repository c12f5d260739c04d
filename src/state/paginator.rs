//! Token-based pagination over ordered variable listings.
//!
//! A continuation token names the first item of the next page by its
//! `(namespace, path)` key, so a token keeps resuming at the right place when
//! other variables are added or removed between pages.

use crate::core::error::{VarError, VarResult};
use crate::vars::model::VarKey;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

const TOKEN_SEPARATOR: char = '\0';

/// Encode a key as a continuation token.
pub fn encode_token(key: &VarKey) -> String {
    let raw = format!("{}{TOKEN_SEPARATOR}{}", key.namespace, key.path);
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Decode a continuation token.
pub fn decode_token(token: &str) -> VarResult<VarKey> {
    let invalid =
        || VarError::invalid(format!("failed to read result page: invalid token {token:?}"));
    let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
    let (namespace, path) = raw.split_once(TOKEN_SEPARATOR).ok_or_else(invalid)?;
    Ok(VarKey::new(namespace, path))
}

/// Paginator over items sorted ascending by key.
#[derive(Debug, Clone)]
pub struct Paginator {
    per_page: usize,
    reverse: bool,
    resume_at: Option<VarKey>,
}

impl Paginator {
    /// Create a paginator. `per_page == 0` returns everything.
    pub fn new(per_page: u32, next_token: &str, reverse: bool) -> VarResult<Self> {
        let resume_at = if next_token.is_empty() {
            None
        } else {
            Some(decode_token(next_token)?)
        };
        Ok(Self {
            per_page: per_page as usize,
            reverse,
            resume_at,
        })
    }

    /// Produce one page and the token of the page after it.
    ///
    /// `items` must be sorted ascending by `key_of`. Items rejected by
    /// `select` are skipped without counting towards the page size.
    pub fn page<T, O>(
        &self,
        mut items: Vec<T>,
        key_of: impl Fn(&T) -> VarKey,
        mut select: impl FnMut(&T) -> bool,
        mut map: impl FnMut(T) -> O,
    ) -> (Vec<O>, String) {
        if self.reverse {
            items.reverse();
        }

        let mut page = Vec::new();
        let mut next_token = String::new();
        for item in items {
            let key = key_of(&item);
            if let Some(ref resume_at) = self.resume_at {
                let before = if self.reverse {
                    key > *resume_at
                } else {
                    key < *resume_at
                };
                if before {
                    continue;
                }
            }
            if !select(&item) {
                continue;
            }
            if self.per_page > 0 && page.len() == self.per_page {
                next_token = encode_token(&key);
                break;
            }
            page.push(map(item));
        }
        (page, next_token)
    }
}

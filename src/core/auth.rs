// Request credentials: SharedKeyLite signing, SAS tokens, or anonymous access.
use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;
use time::macros::format_description;
use url::Url;

use crate::core::error::{Error, ErrorKind};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    SharedKey { account: String, key: Vec<u8> },
    Sas(String),
    Anonymous,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .field("key", &"<redacted>")
                .finish(),
            Credential::Sas(_) => f.debug_tuple("Sas").field(&"<redacted>").finish(),
            Credential::Anonymous => f.write_str("Anonymous"),
        }
    }
}

impl Credential {
    pub fn shared_key(account: impl Into<String>, encoded_key: &str) -> Result<Self, Error> {
        let key = BASE64.decode(encoded_key.trim()).map_err(|err| {
            Error::config("account key is not valid base64").with_source(err)
        })?;
        Ok(Credential::SharedKey {
            account: account.into(),
            key,
        })
    }

    pub fn sas(token: &str) -> Self {
        Credential::Sas(token.trim_start_matches('?').to_string())
    }

    /// Appends the SAS token to the query, keeping any parameters already present.
    pub(crate) fn apply_to_url(&self, url: &mut Url) {
        if let Credential::Sas(token) = self {
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
                _ => token.clone(),
            };
            url.set_query(Some(&query));
        }
    }

    /// `Authorization` header value for a request sent with `x-ms-date: date`.
    pub(crate) fn authorization(&self, date: &str, url: &Url) -> Result<Option<String>, Error> {
        match self {
            Credential::SharedKey { account, key } => {
                let string_to_sign = format!("{date}\n{}", canonical_resource(account, url));
                let signature = sign(key, &string_to_sign)?;
                Ok(Some(format!("SharedKeyLite {account}:{signature}")))
            }
            Credential::Sas(_) | Credential::Anonymous => Ok(None),
        }
    }
}

/// `/account/path[?comp=..]`, the resource part of a SharedKeyLite string-to-sign.
pub(crate) fn canonical_resource(account: &str, url: &Url) -> String {
    let mut resource = format!("/{account}{}", url.path());
    if let Some((_, comp)) = url.query_pairs().find(|(name, _)| name == "comp") {
        resource.push_str("?comp=");
        resource.push_str(&comp);
    }
    resource
}

pub(crate) fn sign(key: &[u8], string_to_sign: &str) -> Result<String, Error> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to initialise request signer")
            .with_source(err)
    })?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// RFC 1123 date as required by `x-ms-date`.
pub(crate) fn http_date(now: OffsetDateTime) -> Result<String, Error> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    now.to_offset(time::UtcOffset::UTC)
        .format(format)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to format request date")
                .with_source(err)
        })
}

#[cfg(test)]
mod tests {
    use super::{Credential, canonical_resource, http_date, sign};
    use crate::core::error::ErrorKind;
    use time::macros::datetime;
    use url::Url;

    #[test]
    fn http_date_is_rfc1123() {
        let date = http_date(datetime!(2009-10-11 21:49:13 UTC)).expect("date");
        assert_eq!(date, "Sun, 11 Oct 2009 21:49:13 GMT");
    }

    #[test]
    fn canonical_resource_uses_encoded_path_and_comp() {
        let url = Url::parse("http://127.0.0.1:10002/devstoreaccount1/people(PartitionKey='a%20b',RowKey='c')")
            .expect("url");
        assert_eq!(
            canonical_resource("devstoreaccount1", &url),
            "/devstoreaccount1/devstoreaccount1/people(PartitionKey='a%20b',RowKey='c')"
        );
        let url = Url::parse("https://acct.table.core.windows.net/?comp=properties&restype=service")
            .expect("url");
        assert_eq!(canonical_resource("acct", &url), "/acct/?comp=properties");
    }

    #[test]
    fn signature_matches_known_hmac() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign(b"key", "The quick brown fox jumps over the lazy dog").expect("sign");
        assert_eq!(signature, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn shared_key_header_names_account() {
        let credential = Credential::shared_key("acct", "a2V5").expect("credential");
        let url = Url::parse("https://acct.table.core.windows.net/people()").expect("url");
        let header = credential
            .authorization("Sun, 11 Oct 2009 21:49:13 GMT", &url)
            .expect("auth")
            .expect("header");
        assert!(header.starts_with("SharedKeyLite acct:"));
    }

    #[test]
    fn sas_token_is_appended_to_query() {
        let credential = Credential::sas("?sv=2019-02-02&sig=abc");
        let mut url = Url::parse("https://acct.table.core.windows.net/people()?$top=5").expect("url");
        credential.apply_to_url(&mut url);
        assert_eq!(url.query(), Some("$top=5&sv=2019-02-02&sig=abc"));
    }

    #[test]
    fn bad_key_is_config_error() {
        let err = Credential::shared_key("acct", "not base64!").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn debug_redacts_secrets() {
        let credential = Credential::shared_key("acct", "a2V5").expect("credential");
        assert!(!format!("{credential:?}").contains("107"));
        assert!(format!("{credential:?}").contains("<redacted>"));
    }
}

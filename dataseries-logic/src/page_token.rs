//! Opaque keyset pagination tokens: base64-encoded JSON arrays of
//! stringified values.

use base64::Engine;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PageTokenParsingError {
    #[error("base64 decode error: {0}")]
    Base64DecodeError(String),
    #[error("json decode error: {0}")]
    JsonDecodeError(String),
    #[error("invalid format, expected {0} values")]
    FormatError(u32),
    #[error("invalid value '{0}'")]
    ParsingError(String),
}

pub trait PageTokenFormat: Sized {
    fn parse_page_token(page_token: String) -> Result<Self, PageTokenParsingError>;
    fn format_page_token(self) -> String;
}

impl PageTokenFormat for Uuid {
    fn parse_page_token(page_token: String) -> Result<Self, PageTokenParsingError> {
        page_token
            .parse()
            .map_err(|_| PageTokenParsingError::ParsingError(page_token))
    }

    fn format_page_token(self) -> String {
        self.to_string()
    }
}

impl PageTokenFormat for DateTime<Utc> {
    fn parse_page_token(page_token: String) -> Result<Self, PageTokenParsingError> {
        match page_token.parse().map(DateTime::from_timestamp_micros) {
            Ok(Some(dt)) => Ok(dt),
            _ => Err(PageTokenParsingError::ParsingError(page_token)),
        }
    }

    fn format_page_token(self) -> String {
        self.timestamp_micros().to_string()
    }
}

// Option<T> encodes as "{is_some}:{value}".
impl<T: PageTokenFormat> PageTokenFormat for Option<T> {
    fn parse_page_token(page_token: String) -> Result<Self, PageTokenParsingError> {
        match page_token.split_once(':') {
            Some(("1", value)) => Ok(Some(T::parse_page_token(value.to_string())?)),
            Some(("0", _)) => Ok(None),
            _ => Err(PageTokenParsingError::ParsingError(page_token)),
        }
    }

    fn format_page_token(self) -> String {
        match self {
            Some(t) => format!("1:{}", t.format_page_token()),
            None => "0:".to_string(),
        }
    }
}

macro_rules! impl_page_token_format_tuple {
    ($len:literal: ($($T:ident $var:ident),+)) => {
        impl<$($T: PageTokenFormat),+> PageTokenFormat for ($($T),+,) {
            fn parse_page_token(page_token: String) -> Result<Self, PageTokenParsingError> {
                let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(page_token)
                    .map_err(|e| PageTokenParsingError::Base64DecodeError(e.to_string()))?;

                let parts: Vec<&str> = serde_json::from_slice(&decoded)
                    .map_err(|e| PageTokenParsingError::JsonDecodeError(e.to_string()))?;

                match parts.as_slice() {
                    &[$($var),+] => Ok((
                        $(
                            $T::parse_page_token($var.to_string())?,
                        )+
                    )),
                    _ => Err(PageTokenParsingError::FormatError($len as u32)),
                }
            }

            fn format_page_token(self) -> String {
                let ($($var),+,) = self;
                let parts = vec![
                    $(
                        $var.format_page_token(),
                    )+
                ];
                let json = serde_json::to_string(&parts)
                    .expect("list of strings should be serializable");
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
            }
        }
    };
}

impl_page_token_format_tuple!(1: (T1 v1));
impl_page_token_format_tuple!(2: (T1 v1, T2 v2));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let pt: (Option<DateTime<Utc>>, Uuid) = (
            Some("2015-09-18T23:56:04Z".parse().unwrap()),
            Uuid::new_v4(),
        );
        let parsed = PageTokenFormat::parse_page_token(pt.format_page_token()).unwrap();
        assert_eq!(pt, parsed);

        let pt: (Option<DateTime<Utc>>, Uuid) = (None, Uuid::nil());
        let parsed = PageTokenFormat::parse_page_token(pt.format_page_token()).unwrap();
        assert_eq!(pt, parsed);

        let pt: (Uuid,) = (Uuid::new_v4(),);
        let parsed = PageTokenFormat::parse_page_token(pt.format_page_token()).unwrap();
        assert_eq!(pt, parsed);
    }

    #[test]
    fn rejects_garbage() {
        assert!(<(Uuid,)>::parse_page_token("???not-base64???".to_string()).is_err());
    }
}

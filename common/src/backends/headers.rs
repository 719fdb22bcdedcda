use headers::{Header, HeaderName};
use http::HeaderValue;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Correlation id attached to every request and echoed on the response.
pub struct XRequestId(pub String);

impl Header for XRequestId {
    fn name() -> &'static HeaderName {
        &X_REQUEST_ID
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .to_string();

        Ok(Self(value))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

pub static X_ON_BEHALF_OF: HeaderName = HeaderName::from_static("x-on-behalf-of");

/// User id a machine principal is acting for. Only honored together with the
/// matching `*:any` permission.
pub struct XOnBehalfOf(pub String);

impl Header for XOnBehalfOf {
    fn name() -> &'static HeaderName {
        &X_ON_BEHALF_OF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .to_string();

        Ok(Self(value))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

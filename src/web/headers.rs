use headers::{Header, HeaderName, HeaderValue};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_CLIENT_FINGERPRINT: HeaderName = HeaderName::from_static("x-client-fingerprint");

/// First hop of `X-Forwarded-For`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct XForwardedFor(pub String);

impl Header for XForwardedFor {
    fn name() -> &'static HeaderName {
        &X_FORWARDED_FOR
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let first_hop = value
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .split(',')
            .next()
            .map(str::trim)
            .unwrap_or_default();

        if first_hop.is_empty() {
            return Err(headers::Error::invalid());
        }

        Ok(XForwardedFor(first_hop.to_string()))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Client-side fingerprint, used when the request body does not carry one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct XClientFingerprint(pub String);

impl Header for XClientFingerprint {
    fn name() -> &'static HeaderName {
        &X_CLIENT_FINGERPRINT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let fingerprint = value
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .trim();

        if fingerprint.is_empty() {
            return Err(headers::Error::invalid());
        }

        Ok(XClientFingerprint(fingerprint.to_string()))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

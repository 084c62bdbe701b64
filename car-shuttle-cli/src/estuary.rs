use anyhow::anyhow;
use car_shuttle::{CarSink, Error};
use reqwest::{
    blocking::{Body, Client},
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use std::io::Read;

/// Posts CAR chunks to an Estuary shuttle's `/content/add-car` endpoint.
///
/// Shuttles index blocks by CID across uploads, which is what [`CarSink`]
/// requires of its implementations.
#[derive(Clone, Debug)]
pub struct EstuaryClient {
    client: Client,
    url: String,
    key: String,
}

impl EstuaryClient {
    /// A client posting to `https://<shuttle_host>/content/add-car`.
    pub fn new(shuttle_host: &str, key: String) -> Self {
        Self {
            client: Client::new(),
            url: format!("https://{shuttle_host}/content/add-car"),
            key,
        }
    }

    /// The URL chunks are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl CarSink for EstuaryClient {
    fn post_car(&self, car: impl Read + Send + 'static, len: u64) -> Result<(), Error> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/car")
            .header(AUTHORIZATION, format!("Bearer {}", self.key))
            .body(Body::sized(car, len))
            .send()
            .map_err(|e| Error::Sink(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Sink(anyhow!("shuttle answered {status}: {body}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_points_at_the_add_car_route() {
        let client = EstuaryClient::new("shuttle-4.estuary.tech", "secret".into());
        assert_eq!(client.url(), "https://shuttle-4.estuary.tech/content/add-car");
    }
}

//! REST client for an HTTP document store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::{Cursor, Page, RemoteGateway, Subscription};
use crate::document::{Document, DocumentId, Fields, Timestamp};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct ApiPage {
  documents: Vec<Document>,
  next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLatest {
  #[serde(rename = "updatedAt")]
  updated_at: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
struct ApiCount {
  count: u64,
}

#[derive(Debug, Deserialize)]
struct ApiCreated {
  id: DocumentId,
}

/// Gateway over `{base}/collections/{name}/...` endpoints.
///
/// The store has no push channel, so [`RemoteGateway::subscribe`] re-fetches
/// the full snapshot every `watch_interval`; repeated identical snapshots are
/// absorbed by the push observer's fingerprint check.
#[derive(Clone)]
pub struct HttpGateway {
  client: Client,
  base: Url,
  token: Option<String>,
  watch_interval: Duration,
}

impl HttpGateway {
  pub fn new(base: &str, token: Option<String>) -> Result<Self> {
    let mut base =
      Url::parse(base).map_err(|e| Error::InvalidConfig(format!("bad remote url {}: {}", base, e)))?;
    // Url::join drops the last segment unless the path ends in '/'.
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(Error::remote)?;

    Ok(Self {
      client,
      base,
      token,
      watch_interval: Duration::from_secs(5),
    })
  }

  pub fn with_watch_interval(mut self, interval: Duration) -> Self {
    self.watch_interval = interval;
    self
  }

  fn url(&self, collection: &str, rest: &str) -> Result<Url> {
    self
      .base
      .join(&format!("collections/{}/{}", collection, rest))
      .map_err(|e| Error::InvalidConfig(e.to_string()))
  }

  fn authed(&self, req: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => req.bearer_auth(token),
      None => req,
    }
  }

  async fn send(&self, req: RequestBuilder, id: Option<&str>) -> Result<Response> {
    let response = self.authed(req).send().await.map_err(Error::remote)?;
    match (response.status(), id) {
      (StatusCode::NOT_FOUND, Some(id)) => Err(Error::NotFound(id.to_string())),
      (status, _) if !status.is_success() => Err(Error::RemoteUnavailable(format!(
        "{} returned {}",
        response.url(),
        status
      ))),
      _ => Ok(response),
    }
  }

  async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T> {
    debug!(%url, "GET");
    self
      .send(self.client.get(url), None)
      .await?
      .json()
      .await
      .map_err(Error::remote)
  }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
  async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>> {
    self.get_json(self.url(collection, "documents")?).await
  }

  async fn fetch_page(
    &self,
    collection: &str,
    page_size: usize,
    after: Option<&Cursor>,
  ) -> Result<Page> {
    let mut url = self.url(collection, "documents")?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("limit", &page_size.to_string());
      if let Some(cursor) = after {
        query.append_pair("after", cursor.as_str());
      }
    }
    let page: ApiPage = self.get_json(url).await?;
    Ok(Page {
      documents: page.documents,
      next: page.next.map(Cursor::new),
    })
  }

  async fn fetch_latest_timestamp(&self, collection: &str) -> Result<Option<Timestamp>> {
    let latest: ApiLatest = self.get_json(self.url(collection, "latest")?).await?;
    Ok(latest.updated_at)
  }

  async fn count(&self, collection: &str) -> Result<u64> {
    let count: ApiCount = self.get_json(self.url(collection, "count")?).await?;
    Ok(count.count)
  }

  async fn create(&self, collection: &str, fields: Fields) -> Result<DocumentId> {
    let url = self.url(collection, "documents")?;
    let created: ApiCreated = self
      .send(self.client.post(url).json(&fields), None)
      .await?
      .json()
      .await
      .map_err(Error::remote)?;
    Ok(created.id)
  }

  async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
    let url = self.url(collection, &format!("documents/{}", id))?;
    self
      .send(self.client.patch(url).json(&fields), Some(id))
      .await?;
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<()> {
    let url = self.url(collection, &format!("documents/{}", id))?;
    self.send(self.client.delete(url), Some(id)).await?;
    Ok(())
  }

  async fn subscribe(&self, collection: &str) -> Result<Subscription> {
    // Fail fast if the store is unreachable.
    let first = self.fetch_all(collection).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(first);

    let gateway = self.clone();
    let collection = collection.to_string();
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(gateway.watch_interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match gateway.fetch_all(&collection).await {
          Ok(snapshot) => {
            if tx.send(snapshot).is_err() {
              break;
            }
          }
          Err(e) => warn!(%collection, error = %e, "snapshot poll failed"),
        }
      }
    });

    Ok(Subscription::new(rx, move || task.abort()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builds_collection_urls() {
    let gw = HttpGateway::new("http://localhost:8080/api", None).unwrap();
    assert_eq!(
      gw.url("products", "documents/abc").unwrap().as_str(),
      "http://localhost:8080/api/collections/products/documents/abc"
    );
  }

  #[test]
  fn rejects_bad_url() {
    assert!(matches!(
      HttpGateway::new("not a url", None),
      Err(Error::InvalidConfig(_))
    ));
  }

  #[test]
  fn decodes_page_body() {
    let page: ApiPage = serde_json::from_str(
      r#"{"documents":[{"id":"a","updatedAt":4,"name":"A"}],"next":"4:a"}"#,
    )
    .unwrap();
    assert_eq!(page.documents[0].id, "a");
    assert_eq!(page.next.as_deref(), Some("4:a"));
  }
}

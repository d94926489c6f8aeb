//! Results repository on GitHub
//!
//! Publishing commits `{data_path}/{experiment}.json` to a fresh
//! `experiment/{experiment}` branch and opens a pull request against the
//! configured base branch, so results are reviewed before they reach the
//! site.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use testbed_common::Error;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "experiment-operator";

/// Branch results for `experiment` are committed to
pub fn results_branch(experiment: &str) -> String {
    format!("experiment/{}", experiment)
}

/// Outcome of a successful publish
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedResult {
    /// Branch holding the commit
    pub branch: String,
    /// Pull request number
    pub pr_number: u64,
    /// Pull request web URL
    pub pr_url: String,
}

/// Destination for reviewed experiment results
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ResultsRepository: Send + Sync {
    /// Commit `document` for `experiment` and open a pull request
    async fn publish(
        &self,
        experiment: &str,
        document: &serde_json::Value,
    ) -> Result<PublishedResult, Error>;
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct ContentInfo {
    sha: String,
}

#[derive(Deserialize)]
struct PullRequest {
    number: u64,
    html_url: String,
}

/// GitHub REST client for one repository
#[derive(Clone)]
pub struct GitHubRepository {
    http: reqwest::Client,
    api_base: String,
    token: String,
    owner: String,
    repo: String,
    base_branch: String,
    data_path: String,
}

impl GitHubRepository {
    /// Create a client for `repository` given as `owner/name`
    pub fn new(
        token: impl Into<String>,
        repository: &str,
        base_branch: impl Into<String>,
        data_path: impl Into<String>,
    ) -> Result<Self, Error> {
        let Some((owner, repo)) = repository
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
        else {
            return Err(Error::configuration(format!(
                "results repository must be owner/name, got {:?}",
                repository
            )));
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::publish(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            base_branch: base_branch.into(),
            data_path: data_path.into().trim_end_matches('/').to_string(),
        })
    }

    /// Point the client at a different API root (GitHub Enterprise, tests)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_base, self.owner, self.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, builder: reqwest::RequestBuilder, action: &str) -> Result<reqwest::Response, Error> {
        builder
            .send()
            .await
            .map_err(|e| Error::publish(format!("{}: {}", action, e)))
    }

    async fn fail(response: reqwest::Response, action: &str) -> Error {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Error::publish(format!("{} returned {}: {}", action, status, body))
    }

    /// Create `branch` from the head of the base branch.
    ///
    /// An existing branch is reused so a retried publish can proceed.
    async fn create_branch(&self, branch: &str) -> Result<(), Error> {
        let url = self.url(&format!("git/ref/heads/{}", self.base_branch));
        let response = self.send(self.request(reqwest::Method::GET, &url), "get base ref").await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, "get base ref").await);
        }
        let base: GitRef = response
            .json()
            .await
            .map_err(|e| Error::publish(format!("decode base ref: {}", e)))?;

        let body = json!({
            "ref": format!("refs/heads/{}", branch),
            "sha": base.object.sha,
        });
        let response = self
            .send(
                self.request(reqwest::Method::POST, &self.url("git/refs")).json(&body),
                "create branch",
            )
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::UNPROCESSABLE_ENTITY => {
                debug!(branch, "results branch already exists");
                Ok(())
            }
            _ => Err(Self::fail(response, "create branch").await),
        }
    }

    async fn existing_file_sha(&self, file_path: &str, branch: &str) -> Result<Option<String>, Error> {
        let url = self.url(&format!("contents/{}", file_path));
        let response = self
            .send(
                self.request(reqwest::Method::GET, &url).query(&[("ref", branch)]),
                "get file",
            )
            .await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let info: ContentInfo = response
                    .json()
                    .await
                    .map_err(|e| Error::publish(format!("decode file info: {}", e)))?;
                Ok(Some(info.sha))
            }
            _ => Err(Self::fail(response, "get file").await),
        }
    }

    async fn commit_file(
        &self,
        experiment: &str,
        branch: &str,
        file_path: &str,
        document: &serde_json::Value,
    ) -> Result<(), Error> {
        let content = serde_json::to_vec_pretty(document)?;
        let sha = self.existing_file_sha(file_path, branch).await?;
        let verb = if sha.is_some() { "Update" } else { "Add" };

        let mut body = json!({
            "message": format!("data: {} {} experiment results", verb, experiment),
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "branch": branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }

        let url = self.url(&format!("contents/{}", file_path));
        let response = self
            .send(self.request(reqwest::Method::PUT, &url).json(&body), "commit file")
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, "commit file").await);
        }
        Ok(())
    }

    async fn open_pull_request(
        &self,
        experiment: &str,
        branch: &str,
        file_path: &str,
    ) -> Result<PullRequest, Error> {
        let body = json!({
            "title": format!("data: Add {} experiment results", experiment),
            "body": format!(
                "Experiment `{}` completed. Results committed to `{}` for review.\n\n\
                 Preview locally:\n```\ngit fetch && git checkout {}\ncd site && npm run dev\n```",
                experiment, file_path, branch
            ),
            "head": branch,
            "base": self.base_branch,
        });
        let response = self
            .send(
                self.request(reqwest::Method::POST, &self.url("pulls")).json(&body),
                "create pull request",
            )
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, "create pull request").await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::publish(format!("decode pull request: {}", e)))
    }
}

#[async_trait]
impl ResultsRepository for GitHubRepository {
    async fn publish(
        &self,
        experiment: &str,
        document: &serde_json::Value,
    ) -> Result<PublishedResult, Error> {
        let branch = results_branch(experiment);
        let file_path = format!("{}/{}.json", self.data_path, experiment);

        self.create_branch(&branch).await?;
        self.commit_file(experiment, &branch, &file_path, document).await?;
        let pr = self.open_pull_request(experiment, &branch, &file_path).await?;

        info!(experiment, branch = %branch, pr = pr.number, "published experiment results");
        Ok(PublishedResult {
            branch,
            pr_number: pr.number,
            pr_url: pr.html_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn repository(server: &MockServer) -> GitHubRepository {
        GitHubRepository::new("ghp_test", "illm/k8s-lab", "main", "site/data/")
            .unwrap()
            .with_api_base(server.uri())
    }

    async fn mount_base_ref(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/repos/illm/k8s-lab/git/ref/heads/main"))
            .and(header("authorization", "Bearer ghp_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ref": "refs/heads/main",
                "object": {"sha": "abc123", "type": "commit"}
            })))
            .mount(server)
            .await;
    }

    async fn mount_pull_request(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/repos/illm/k8s-lab/pulls"))
            .and(body_partial_json(json!({
                "title": "data: Add tsdb experiment results",
                "head": "experiment/tsdb",
                "base": "main"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "number": 42,
                "html_url": "https://github.com/illm/k8s-lab/pull/42"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn rejects_malformed_repository() {
        for bad in ["k8s-lab", "/k8s-lab", "illm/", "a/b/c"] {
            let err = GitHubRepository::new("t", bad, "main", "site/data").err().unwrap();
            assert!(matches!(err, Error::Configuration { .. }), "{}", bad);
        }
    }

    /// Story: a completed experiment is committed to its own branch and a
    /// pull request is opened for review
    #[tokio::test]
    async fn publishes_new_results() {
        let server = MockServer::start().await;
        mount_base_ref(&server).await;
        Mock::given(method("POST"))
            .and(path("/repos/illm/k8s-lab/git/refs"))
            .and(body_partial_json(json!({"ref": "refs/heads/experiment/tsdb", "sha": "abc123"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/illm/k8s-lab/contents/site/data/tsdb.json"))
            .and(query_param("ref", "experiment/tsdb"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/illm/k8s-lab/contents/site/data/tsdb.json"))
            .and(body_partial_json(json!({
                "message": "data: Add tsdb experiment results",
                "branch": "experiment/tsdb"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        mount_pull_request(&server).await;

        let result = repository(&server)
            .publish("tsdb", &json!({"name": "tsdb"}))
            .await
            .unwrap();

        assert_eq!(
            result,
            PublishedResult {
                branch: "experiment/tsdb".to_string(),
                pr_number: 42,
                pr_url: "https://github.com/illm/k8s-lab/pull/42".to_string(),
            }
        );

        let requests: Vec<Request> = server.received_requests().await.unwrap();
        let commit = requests.iter().find(|r| r.method.as_str() == "PUT").unwrap();
        let body: serde_json::Value = serde_json::from_slice(&commit.body).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(body["content"].as_str().unwrap())
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "{\n  \"name\": \"tsdb\"\n}");
        assert!(body.get("sha").is_none());
    }

    /// Story: re-publishing after a partial failure reuses the branch and
    /// updates the existing file in place
    #[tokio::test]
    async fn republish_updates_existing_file() {
        let server = MockServer::start().await;
        mount_base_ref(&server).await;
        Mock::given(method("POST"))
            .and(path("/repos/illm/k8s-lab/git/refs"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "Reference already exists"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/illm/k8s-lab/contents/site/data/tsdb.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "def456"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/illm/k8s-lab/contents/site/data/tsdb.json"))
            .and(body_partial_json(json!({
                "message": "data: Update tsdb experiment results",
                "sha": "def456"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        mount_pull_request(&server).await;

        let result = repository(&server).publish("tsdb", &json!({})).await.unwrap();
        assert_eq!(result.pr_number, 42);
    }

    #[tokio::test]
    async fn missing_base_branch_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/illm/k8s-lab/git/ref/heads/main"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let err = repository(&server).publish("tsdb", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
        assert!(err.to_string().contains("get base ref returned 404"));
    }
}

use std::convert::Infallible;
use std::path::PathBuf;

use axum::http::{HeaderName, HeaderValue, Method};
use clap::{ArgAction, Args};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::error::ConfigError;

pub const DEFAULT_MODEL_PATH: &str = "./pretrained/finance_chatbot_0615_1817";

#[derive(Debug, Clone, Args)]
pub struct ModelConfig {
    /// Directory holding config.json, tokenizer.json and safetensors weights
    #[arg(long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_PATH)]
    pub model_path: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Upper bound applied to a request's max_length
    #[arg(long, env = "MAX_LENGTH_LIMIT", default_value_t = 1024)]
    pub max_length_limit: usize,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cross-origin policy, read from the environment once at startup.
#[derive(Debug, Clone, Args)]
pub struct CorsConfig {
    /// Comma-separated list of allowed origins, `*` for any
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// Allow cookies and authorization headers; only "true" enables it
    #[arg(
        long,
        env = "CORS_ALLOW_CREDENTIALS",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = parse_flag
    )]
    pub allow_credentials: bool,

    #[arg(
        long,
        env = "CORS_ALLOW_METHODS",
        value_delimiter = ',',
        default_value = "GET,POST,PUT,DELETE,OPTIONS"
    )]
    pub allow_methods: Vec<String>,

    #[arg(long, env = "CORS_ALLOW_HEADERS", value_delimiter = ',', default_value = "*")]
    pub allow_headers: Vec<String>,
}

fn parse_flag(value: &str) -> Result<bool, Infallible> {
    Ok(value.trim().eq_ignore_ascii_case("true"))
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            allow_credentials: true,
            allow_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            allow_headers: vec!["*".to_string()],
        }
    }
}

fn entries(values: &[String]) -> impl Iterator<Item = &str> {
    values.iter().map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn is_wildcard(values: &[String]) -> bool {
    entries(values).any(|v| v == "*")
}

impl CorsConfig {
    /// Builds the CORS layer.
    ///
    /// Browsers reject a literal `*` on credentialed requests, so wildcards
    /// combined with credentials mirror the request instead.
    pub fn layer(&self) -> Result<CorsLayer, ConfigError> {
        let credentials = self.allow_credentials;

        let origin = if is_wildcard(&self.allowed_origins) {
            if credentials {
                AllowOrigin::mirror_request()
            } else {
                AllowOrigin::any()
            }
        } else {
            let origins = entries(&self.allowed_origins)
                .map(|o| HeaderValue::from_str(o).map_err(|_| ConfigError::InvalidOrigin(o.to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            AllowOrigin::list(origins)
        };

        let methods = if is_wildcard(&self.allow_methods) {
            if credentials {
                AllowMethods::mirror_request()
            } else {
                AllowMethods::any()
            }
        } else {
            let methods = entries(&self.allow_methods)
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| ConfigError::InvalidMethod(m.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            AllowMethods::list(methods)
        };

        let headers = if is_wildcard(&self.allow_headers) {
            if credentials {
                AllowHeaders::mirror_request()
            } else {
                AllowHeaders::any()
            }
        } else {
            let headers = entries(&self.allow_headers)
                .map(|h| HeaderName::from_bytes(h.as_bytes()).map_err(|_| ConfigError::InvalidHeader(h.to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            AllowHeaders::list(headers)
        };

        Ok(CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(credentials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        cors: CorsConfig,
        #[command(flatten)]
        server: ServerConfig,
        #[command(flatten)]
        model: ModelConfig,
    }

    #[test]
    fn defaults_match_documented_values() {
        let parsed = Harness::parse_from(["test"]);
        assert_eq!(parsed.cors.allowed_origins, vec!["http://localhost:3000"]);
        assert!(parsed.cors.allow_credentials);
        assert_eq!(parsed.cors.allow_methods.len(), 5);
        assert_eq!(parsed.cors.allow_headers, vec!["*"]);
    }

    #[test]
    fn comma_separated_lists_are_split() {
        let parsed = Harness::parse_from([
            "test",
            "--allowed-origins",
            "http://a.example,http://b.example",
            "--allow-credentials",
            "False",
        ]);
        assert_eq!(parsed.cors.allowed_origins, vec!["http://a.example", "http://b.example"]);
        assert!(!parsed.cors.allow_credentials);
    }

    #[test]
    fn server_and_model_flags() {
        let parsed = Harness::parse_from([
            "test",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--model-path",
            "/models/t5",
        ]);
        assert_eq!(parsed.server.addr(), "127.0.0.1:9000");
        assert_eq!(parsed.model.model_path, PathBuf::from("/models/t5"));
    }

    #[test]
    fn credential_flag_only_accepts_true() {
        assert_eq!(parse_flag("TRUE"), Ok(true));
        assert_eq!(parse_flag("yes"), Ok(false));
        assert_eq!(parse_flag("1"), Ok(false));
    }

    #[test]
    fn default_policy_builds() {
        assert!(CorsConfig::default().layer().is_ok());
    }

    #[tokio::test]
    async fn wildcards_with_credentials_mirror_the_request() {
        use axum::body::Body;
        use axum::http::{header, Request};
        use axum::routing::post;
        use tower::ServiceExt;

        let cfg = CorsConfig {
            allowed_origins: vec!["*".into()],
            allow_methods: vec!["*".into()],
            ..CorsConfig::default()
        };
        // tower-http rejects `*` with credentials when the layer is applied.
        let app = axum::Router::new()
            .route("/predict", post(|| async { "ok" }))
            .layer(cfg.layer().unwrap());

        let preflight = Request::builder()
            .method(Method::OPTIONS)
            .uri("/predict")
            .header(header::ORIGIN, "http://anywhere.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-trace-id")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(preflight).await.unwrap();

        let header_str = |name: header::HeaderName| response.headers().get(name).and_then(|v| v.to_str().ok());
        assert_eq!(header_str(header::ACCESS_CONTROL_ALLOW_ORIGIN), Some("http://anywhere.example"));
        assert_eq!(header_str(header::ACCESS_CONTROL_ALLOW_METHODS), Some("POST"));
        assert_eq!(header_str(header::ACCESS_CONTROL_ALLOW_HEADERS), Some("x-trace-id"));
        assert_eq!(header_str(header::ACCESS_CONTROL_ALLOW_CREDENTIALS), Some("true"));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        let bad_origin = CorsConfig {
            allowed_origins: vec!["http://ok.example".into(), "bad\norigin".into()],
            ..CorsConfig::default()
        };
        assert!(matches!(bad_origin.layer(), Err(ConfigError::InvalidOrigin(_))));

        let bad_method = CorsConfig {
            allow_methods: vec!["GET".into(), "NOT A METHOD".into()],
            ..CorsConfig::default()
        };
        assert!(matches!(bad_method.layer(), Err(ConfigError::InvalidMethod(_))));

        let bad_header = CorsConfig {
            allow_headers: vec!["x ok".into()],
            ..CorsConfig::default()
        };
        assert!(matches!(bad_header.layer(), Err(ConfigError::InvalidHeader(_))));
    }
}

use crate::services::FeedStatus;
use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{App, HttpResponse, HttpServer, Responder, web};
use exchanges::ExchangeRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// State shared with the HTTP status handlers.
#[derive(Clone)]
pub struct HttpState {
	pub registry: Arc<ExchangeRegistry>,
	pub services: Vec<(&'static str, Arc<FeedStatus>)>,
}

async fn health(state: web::Data<HttpState>) -> impl Responder {
	let exchanges = state.registry.health_check_all().await;
	let services: HashMap<String, HashMap<String, bool>> =
		state.services.iter().map(|(name, status)| ((*name).to_string(), status.snapshot())).collect();

	HttpResponse::Ok().json(serde_json::json!({
		"status": "ok",
		"exchanges": exchanges,
		"services": services,
	}))
}

async fn list_exchanges(state: web::Data<HttpState>) -> impl Responder {
	let exchanges: Vec<serde_json::Value> = state
		.registry
		.list()
		.into_iter()
		.map(|name| serde_json::json!({ "name": name, "capabilities": state.registry.capabilities(name) }))
		.collect();

	HttpResponse::Ok().json(exchanges)
}

async fn exchange_capabilities(
	state: web::Data<HttpState>,
	name: web::Path<String>,
) -> Result<impl Responder, actix_web::Error> {
	state.registry.capabilities(&name).map_or_else(
		|| Err(actix_web::error::ErrorNotFound(format!("unknown exchange: {name}"))),
		|capabilities| Ok(HttpResponse::Ok().json(capabilities)),
	)
}

fn build_cors(origins: &[String]) -> Cors {
	let mut cors = Cors::default()
		.allowed_methods(vec!["GET"])
		.allowed_headers(vec![header::CONTENT_TYPE, header::ACCEPT])
		.max_age(3600);
	for origin in origins {
		cors = cors.allowed_origin(origin);
	}
	cors
}

/// Builds the status server; the caller awaits the returned server future.
pub fn serve(bind: &str, state: HttpState, origins: Vec<String>) -> std::io::Result<actix_web::dev::Server> {
	let server = HttpServer::new(move || {
		App::new()
			.wrap(build_cors(&origins))
			.app_data(web::Data::new(state.clone()))
			.route("/health", web::get().to(health))
			.route("/exchanges", web::get().to(list_exchanges))
			.route("/exchanges/{name}/capabilities", web::get().to(exchange_capabilities))
	})
	.bind(bind)?
	.run();

	Ok(server)
}

#[cfg(test)]
mod tests {
	use super::*;
	use actix_web::{http::StatusCode, test};

	fn state() -> HttpState {
		HttpState {
			registry: Arc::new(ExchangeRegistry::with_default_venues(30).unwrap()),
			services: vec![("liquidations", Arc::new(FeedStatus::default()))],
		}
	}

	#[actix_web::test]
	async fn exchanges_listing_includes_capabilities() {
		let app = test::init_service(
			App::new().app_data(web::Data::new(state())).route("/exchanges", web::get().to(list_exchanges)),
		)
		.await;

		let req = test::TestRequest::get().uri("/exchanges").to_request();
		let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

		let names: Vec<&str> = body.as_array().unwrap().iter().map(|e| e["name"].as_str().unwrap()).collect();
		assert_eq!(names, vec!["binance", "bybit", "hyperliquid", "okx"]);

		let okx = &body.as_array().unwrap()[3]["capabilities"];
		assert_eq!(okx["liquidations"], true);
		assert_eq!(okx["ohlc"], false);
	}

	#[actix_web::test]
	async fn unknown_exchange_is_a_404() {
		let app = test::init_service(
			App::new()
				.app_data(web::Data::new(state()))
				.route("/exchanges/{name}/capabilities", web::get().to(exchange_capabilities)),
		)
		.await;

		let req = test::TestRequest::get().uri("/exchanges/kraken/capabilities").to_request();
		let resp = test::call_service(&app, req).await;
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	}

	#[actix_web::test]
	async fn known_exchange_capabilities_resolve() {
		let app = test::init_service(
			App::new()
				.app_data(web::Data::new(state()))
				.route("/exchanges/{name}/capabilities", web::get().to(exchange_capabilities)),
		)
		.await;

		let req = test::TestRequest::get().uri("/exchanges/Binance/capabilities").to_request();
		let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
		assert_eq!(body["ohlc"], true);
		assert_eq!(body["liquidations"], true);
	}

	#[actix_web::test]
	async fn cors_preflight_allows_configured_origin() {
		let origins = vec!["http://localhost:3000".to_string()];
		let app = test::init_service(
			App::new()
				.wrap(build_cors(&origins))
				.app_data(web::Data::new(state()))
				.route("/exchanges", web::get().to(list_exchanges)),
		)
		.await;

		let req = test::TestRequest::default()
			.method(actix_web::http::Method::OPTIONS)
			.uri("/exchanges")
			.insert_header((header::ORIGIN, "http://localhost:3000"))
			.insert_header((header::ACCESS_CONTROL_REQUEST_METHOD, "GET"))
			.to_request();

		let resp = test::call_service(&app, req).await;
		assert!(resp.status().is_success());
		let allow = resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap();
		assert_eq!(allow.to_str().unwrap(), "http://localhost:3000");
	}
}

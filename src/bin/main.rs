use fund_assistant::{
    config::{AssistantConfig, LedgerBackend},
    TurnRequest,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// (intent, utterance, parameters) for one scripted turn
type Step = (&'static str, &'static str, serde_json::Value);

fn script() -> Vec<Step> {
    use serde_json::json;

    vec![
        ("Default Welcome Intent", "hi", json!({})),
        ("Create Account", "I want to open an account", json!({})),
        ("Confirm Account", "yes", json!({})),
        ("Provide Name", "Asha Rao", json!({})),
        ("Provide Mobile", "12345", json!({})),
        ("Provide Mobile", "98765 43210", json!({})),
        ("Provide Age", "34", json!({})),
        ("Provide Email", "asha@example.com", json!({})),
        ("Fund Details", "tell me about the growth fund", json!({"FundName": "Growth Fund"})),
        ("Purchase Fund", "invest 2000 in growth fund", json!({"FundName": "Growth Fund", "amount": 2000})),
        ("Check Balance", "what's my balance", json!({})),
        ("Redeem Fund", "redeem 1000 from growth fund", json!({"FundName": "Growth Fund", "amount": 1000})),
        ("FAQs", "what is NAV?", json!({})),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // The demo never touches a real ledger
    let mut config = AssistantConfig::from_env()?;
    config.ledger_backend = LedgerBackend::Memory;
    let assistant = config.build_assistant()?;

    info!("Fund Assistant demo conversation starting");

    let session_id = format!("demo-{}", uuid::Uuid::new_v4());
    for (intent, text, params) in script() {
        let mut request = TurnRequest::new(&session_id, intent).with_query(text);
        if let serde_json::Value::Object(params) = params {
            request.parameters = params;
        }

        let response = assistant.handle_turn(request).await;
        println!("> {}", text);
        println!("{}\n", response.reply_text);
    }

    Ok(())
}

use crate::types::{ClientConfig, ANY_ORIGIN};

pub const FALLBACK_CLIENT_ID: &str = "default";
pub const DEMO_CLIENT_IDS: [&str; 2] = ["ansury-lux-123", "ansury-saas-456"];

/// Profile rendered before any configuration has loaded, so the widget is never blank.
pub fn fallback_profile() -> ClientConfig {
    ClientConfig {
        id: FALLBACK_CLIENT_ID.to_string(),
        user_id: "system".to_string(),
        name: "Ansury AI".to_string(),
        primary_color: "#000000".to_string(),
        greeting: "Hello! How can we help you today?".to_string(),
        system_instruction: "You are a helpful AI assistant.".to_string(),
        logo_url: None,
        thinking_enabled: false,
        thinking_budget: 0,
        authorized_origins: vec![ANY_ORIGIN.to_string()],
        created_at: String::new(),
    }
}

/// Demo configurations served when the store has no row for the identifier.
pub fn demo_config(client_id: &str) -> Option<ClientConfig> {
    let config = match client_id {
        "ansury-lux-123" => ClientConfig {
            id: client_id.to_string(),
            user_id: "user_123".to_string(),
            name: "Elite Estates AI".to_string(),
            primary_color: "#B8860B".to_string(),
            greeting: "Welcome to Elite Estates. How can I assist you in finding your dream luxury property today?".to_string(),
            system_instruction: "You are an elite sales concierge for a luxury real estate firm. Be sophisticated, professional, and focus on high-ticket property details. Always try to qualify the lead by asking about their budget or preferred location.".to_string(),
            logo_url: None,
            thinking_enabled: true,
            thinking_budget: 4000,
            authorized_origins: vec![ANY_ORIGIN.to_string()],
            created_at: String::new(),
        },
        "ansury-saas-456" => ClientConfig {
            id: client_id.to_string(),
            user_id: "user_123".to_string(),
            name: "TechFlow Assistant".to_string(),
            primary_color: "#4F46E5".to_string(),
            greeting: "Hi there! Ready to supercharge your workflow with TechFlow?".to_string(),
            system_instruction: "You are a helpful SaaS sales engineer. Focus on technical features, ROI, and ease of integration. Your goal is to get the user to book a demo.".to_string(),
            logo_url: None,
            thinking_enabled: false,
            thinking_budget: 0,
            authorized_origins: vec!["localhost".to_string(), "ansury.systems".to_string()],
            created_at: String::new(),
        },
        _ => return None,
    };
    Some(config)
}

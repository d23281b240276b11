//! Read helpers over the planning API's page property JSON.

use serde_json::Value;

fn property<'a>(page: &'a Value, name: &str) -> Option<&'a Value> {
    page.get("properties")?.get(name)
}

fn plain_text(fragments: &Value) -> Option<String> {
    let parts = fragments.as_array()?;
    let text = parts
        .iter()
        .filter_map(|part| part.get("plain_text").and_then(Value::as_str))
        .collect::<String>();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

pub fn title(page: &Value, name: &str) -> Option<String> {
    plain_text(property(page, name)?.get("title")?)
}

pub fn rich_text(page: &Value, name: &str) -> Option<String> {
    plain_text(property(page, name)?.get("rich_text")?)
}

pub fn select(page: &Value, name: &str) -> Option<String> {
    property(page, name)?
        .get("select")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

pub fn status(page: &Value, name: &str) -> Option<String> {
    property(page, name)?
        .get("status")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

use artforge_contracts::backends::OutputShape;
use artforge_contracts::GenerationError;
use serde_json::Value;

/// Extracts image URLs from a succeeded prediction's `output`, using the
/// shape the backend declares instead of probing for likely keys.
pub fn decode_output(
    backend: &str,
    shape: &OutputShape,
    output: &Value,
) -> Result<Vec<String>, GenerationError> {
    let urls = match (shape, output) {
        (OutputShape::SingleUrl, Value::String(url)) => vec![url.clone()],
        (OutputShape::UrlList, Value::Array(rows)) => rows
            .iter()
            .map(|row| {
                row.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| decode_error(backend, "expected a list of URL strings"))
            })
            .collect::<Result<Vec<String>, GenerationError>>()?,
        (OutputShape::ObjectList { field }, Value::Array(rows)) => rows
            .iter()
            .map(|row| {
                row.get(field.as_str())
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        decode_error(backend, &format!("expected objects with a '{field}' URL"))
                    })
            })
            .collect::<Result<Vec<String>, GenerationError>>()?,
        (_, Value::Null) => return Err(decode_error(backend, "prediction has no output")),
        (shape, other) => {
            return Err(decode_error(
                backend,
                &format!("output {} does not match declared shape {shape:?}", kind_of(other)),
            ))
        }
    };

    let urls: Vec<String> = urls
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();
    if let Some(bad) = urls.iter().find(|url| !url.starts_with("http")) {
        return Err(decode_error(backend, &format!("'{bad}' is not an http(s) URL")));
    }
    if urls.is_empty() {
        return Err(decode_error(backend, "output contained no image URLs"));
    }
    Ok(urls)
}

fn decode_error(backend: &str, message: &str) -> GenerationError {
    GenerationError::Decode {
        backend: backend.to_string(),
        message: message.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

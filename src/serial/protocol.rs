use super::{Result, SerialError};

/// Line protocol spoken by the pad firmware.
///
/// Every request is a single newline-terminated ASCII line and every
/// response is a single line of the form `<tag> v0 v1 ... v(N-1)`.
/// There is no batch command: setting a threshold always echoes the
/// whole threshold vector back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `v` - read the current sensor values
    Values,
    /// `t` - read the current thresholds
    Thresholds,
    /// `<index> <value>` - set one threshold
    SetThreshold { index: usize, value: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Values,
    Thresholds,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Values => "v",
            Tag::Thresholds => "t",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "v" => Some(Tag::Values),
            "t" => Some(Tag::Thresholds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub tag: Tag,
    pub values: Vec<i32>,
}

impl Request {
    /// Encode the request as it goes on the wire, newline included.
    pub fn encode(&self) -> String {
        match self {
            Request::Values => "v\n".to_string(),
            Request::Thresholds => "t\n".to_string(),
            Request::SetThreshold { index, value } => format!("{} {}\n", index, value),
        }
    }

    /// Tag the device answers this request with.
    pub fn expected_tag(&self) -> Tag {
        match self {
            Request::Values => Tag::Values,
            Request::Thresholds | Request::SetThreshold { .. } => Tag::Thresholds,
        }
    }

    /// Device-side decoding of a request line. Used by the emulator.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["v"] => Some(Request::Values),
            ["t"] => Some(Request::Thresholds),
            [index, value] => Some(Request::SetThreshold {
                index: index.parse().ok()?,
                value: value.parse().ok()?,
            }),
            _ => None,
        }
    }
}

impl Response {
    pub fn encode(&self) -> String {
        let mut line = self.tag.as_str().to_string();
        for value in &self.values {
            line.push(' ');
            line.push_str(&value.to_string());
        }
        line.push('\n');
        line
    }
}

/// Parse a response line (trailing newline already stripped).
///
/// When `sensor_count` is known the line must carry exactly that many
/// values; before discovery any non-empty vector is accepted.
pub fn parse_response(line: &str, sensor_count: Option<usize>) -> Result<Response> {
    let mut parts = line.split_whitespace();

    let tag_token = parts
        .next()
        .ok_or_else(|| SerialError::ProtocolError("Empty response".to_string()))?;
    let tag = Tag::from_token(tag_token)
        .ok_or_else(|| SerialError::ProtocolError(format!("Unknown response tag: {:?}", tag_token)))?;

    let values = parts
        .map(|token| {
            token
                .parse::<i32>()
                .map_err(|_| SerialError::ProtocolError(format!("Invalid value {:?} in response {:?}", token, line)))
        })
        .collect::<Result<Vec<i32>>>()?;

    match sensor_count {
        Some(expected) if values.len() != expected => Err(SerialError::ProtocolError(format!(
            "Expected {} values, got {} in response {:?}",
            expected,
            values.len(),
            line
        ))),
        None if values.is_empty() => Err(SerialError::ProtocolError(format!(
            "Response carries no values: {:?}",
            line
        ))),
        _ => Ok(Response { tag, values }),
    }
}

/// Parse a response and check it answers the request that was sent.
pub fn expect_response(line: &str, expected: Tag, sensor_count: Option<usize>) -> Result<Vec<i32>> {
    let response = parse_response(line, sensor_count)?;
    if response.tag != expected {
        return Err(SerialError::ProtocolError(format!(
            "Expected '{}' response, got {:?}",
            expected.as_str(),
            line
        )));
    }
    Ok(response.values)
}

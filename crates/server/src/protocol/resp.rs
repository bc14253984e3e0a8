//! RESP wire encoding. Pure encoders; decoding lives in [`super::parser`].

/// `+<text>\r\n`
pub fn simple_string(text: &str) -> Vec<u8> {
    format!("+{}\r\n", text).into_bytes()
}

/// `-<text>\r\n`
pub fn simple_error(text: &str) -> Vec<u8> {
    format!("-{}\r\n", text).into_bytes()
}

/// `:<decimal>\r\n`
pub fn integer(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

/// `$<len>\r\n<bytes>\r\n`
pub fn bulk_string(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// The null bulk string `$-1\r\n`.
pub fn null_bulk_string() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// `*<n>\r\n` followed by the already-encoded elements.
pub fn array(elements: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", elements.len()).into_bytes();
    for element in elements {
        out.extend_from_slice(&element);
    }
    out
}

/// The null array `*-1\r\n`.
pub fn null_array() -> Vec<u8> {
    b"*-1\r\n".to_vec()
}

/// A request frame: an array of bulk strings. Used for the handshake and
/// replication control frames the server originates itself.
pub fn command(args: &[&[u8]]) -> Vec<u8> {
    array(args.iter().map(|a| bulk_string(a)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_kinds() {
        assert_eq!(simple_string("PONG"), b"+PONG\r\n");
        assert_eq!(simple_error("ERR boom"), b"-ERR boom\r\n");
        assert_eq!(integer(0), b":0\r\n");
        assert_eq!(integer(-1), b":-1\r\n");
    }

    #[test]
    fn test_bulk_string() {
        assert_eq!(bulk_string(b"bar"), b"$3\r\nbar\r\n");
        assert_eq!(bulk_string(b""), b"$0\r\n\r\n");
        assert_eq!(null_bulk_string(), b"$-1\r\n");
    }

    #[test]
    fn test_array() {
        let encoded = array(vec![bulk_string(b"a"), bulk_string(b"1")]);
        assert_eq!(encoded, b"*2\r\n$1\r\na\r\n$1\r\n1\r\n");
        assert_eq!(array(vec![]), b"*0\r\n");
        assert_eq!(null_array(), b"*-1\r\n");
    }

    #[test]
    fn test_command_frame() {
        assert_eq!(
            command(&[b"REPLCONF", b"GETACK", b"*"]),
            b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n"
        );
    }
}

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::ConnectionError;

/// 连接文本读写所使用的字符集。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 行协议（SMTP、Redis inline 命令等）经常需要“按分隔符读取一行文本”，
///   连接持有一个字符集，使文本 API 与字节 API 共享同一套分帧逻辑。
///
/// ## 契约 (What)
/// - 编码遇到字符集无法表示的字符时以 `?` 替代，不会失败；
/// - 解码遇到非法字节返回 [`ConnectionError::Decode`]，且已读取的字节不会退回队列，
///   需要可回退语义的调用方应先设置读标记。
///
/// ## 注意事项 (Trade-offs)
/// - 仅覆盖单字节字符集与 UTF-8，足以支撑常见的行协议；更多编码可通过
///   [`StreamTransform`](crate::StreamTransform) 或在业务层自行转换。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum Charset {
    #[default]
    #[serde(rename = "utf-8", alias = "UTF-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "iso-8859-1", alias = "ISO-8859-1", alias = "latin1")]
    Latin1,
    #[serde(rename = "us-ascii", alias = "US-ASCII", alias = "ascii")]
    Ascii,
}

impl Charset {
    /// 规范名称。
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Ascii => "US-ASCII",
        }
    }

    /// 将文本编码为字节。
    pub fn encode(&self, text: &str) -> Bytes {
        match self {
            Charset::Utf8 => Bytes::copy_from_slice(text.as_bytes()),
            Charset::Latin1 => text
                .chars()
                .map(|ch| u8::try_from(u32::from(ch)).unwrap_or(b'?'))
                .collect::<Vec<u8>>()
                .into(),
            Charset::Ascii => text
                .chars()
                .map(|ch| if ch.is_ascii() { ch as u8 } else { b'?' })
                .collect::<Vec<u8>>()
                .into(),
        }
    }

    /// 将字节解码为文本。
    pub fn decode(&self, bytes: &[u8]) -> Result<String, ConnectionError> {
        match self {
            Charset::Utf8 => {
                std::str::from_utf8(bytes)
                    .map(str::to_owned)
                    .map_err(|err| ConnectionError::Decode {
                        charset: *self,
                        detail: err.to_string(),
                    })
            }
            Charset::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Charset::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(offset) => Err(ConnectionError::Decode {
                    charset: *self,
                    detail: format!("non-ascii byte at offset {offset}"),
                }),
                None => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            },
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_round_trips_high_bytes() {
        let text = "caf\u{e9}";
        let bytes = Charset::Latin1.encode(text);
        assert_eq!(&bytes[..], b"caf\xe9");
        assert_eq!(Charset::Latin1.decode(&bytes).expect("latin1 总能解码"), text);
    }

    #[test]
    fn unmappable_characters_become_question_marks() {
        assert_eq!(&Charset::Ascii.encode("a\u{e9}b")[..], b"a?b");
        assert_eq!(&Charset::Latin1.encode("\u{4e2d}")[..], b"?");
    }

    #[test]
    fn invalid_utf8_reports_decode_error() {
        let err = Charset::Utf8.decode(&[0xff, 0xfe]).expect_err("非法 UTF-8");
        assert!(matches!(err, ConnectionError::Decode { charset: Charset::Utf8, .. }));
        assert!(Charset::Ascii.decode(&[0x80]).is_err());
    }
}

// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/lib.rs - 库主文件
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

pub mod export;
pub mod frame;
pub mod input;
pub mod model;
#[cfg(feature = "save_image_file")]
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod session;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 将 URL 路径解码为本地文件路径（支持 `%20` 等转义字符）
pub(crate) fn url_path(url: &url::Url) -> std::path::PathBuf {
  let path = url.path();
  match urlencoding::decode(path) {
    Ok(decoded) => std::path::PathBuf::from(decoded.into_owned()),
    Err(_) => std::path::PathBuf::from(path),
  }
}

/// 读取 URL 查询参数并解析，缺失时返回 `None`
pub(crate) fn query_param<T: std::str::FromStr>(
  url: &url::Url,
  key: &str,
) -> Result<Option<T>, String> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, value)) => value
      .parse::<T>()
      .map(Some)
      .map_err(|_| format!("invalid value for '{}': {}", key, value)),
    None => Ok(None),
  }
}

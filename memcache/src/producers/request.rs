use std::fmt;
use std::sync::Arc;

/// Target dimensions an image should be downsampled to while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResizeOptions {
  pub width: u32,
  pub height: u32,
}

impl ResizeOptions {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }
}

/// How the decoder should rotate the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RotationOptions {
  /// Rotate according to the image's own metadata.
  #[default]
  Auto,
  /// Never rotate.
  Disabled,
  /// Rotate clockwise by a multiple of 90 degrees.
  Degrees(u16),
}

/// The deepest pipeline stage a request may reach.
///
/// Ordered from the most expensive level (`FullFetch`) to the cheapest
/// (`BitmapMemoryCache`). A request whose lowest permitted level is above a
/// stage's level finishes with an empty result instead of running that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestLevel {
  #[default]
  FullFetch,
  DiskCache,
  EncodedMemoryCache,
  BitmapMemoryCache,
}

/// An immutable description of the image a caller wants.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ImageRequest {
  source_uri: Arc<str>,
  resize_options: Option<ResizeOptions>,
  rotation_options: RotationOptions,
  lowest_permitted_request_level: RequestLevel,
  progressive_rendering_enabled: bool,
}

impl ImageRequest {
  pub fn new(source_uri: impl Into<Arc<str>>) -> Self {
    Self {
      source_uri: source_uri.into(),
      resize_options: None,
      rotation_options: RotationOptions::Auto,
      lowest_permitted_request_level: RequestLevel::FullFetch,
      progressive_rendering_enabled: false,
    }
  }

  pub fn with_resize(mut self, width: u32, height: u32) -> Self {
    self.resize_options = Some(ResizeOptions::new(width, height));
    self
  }

  pub fn with_rotation(mut self, rotation: RotationOptions) -> Self {
    self.rotation_options = rotation;
    self
  }

  /// Restricts the request to the given stage and the cheaper ones above it.
  pub fn with_lowest_permitted_request_level(mut self, level: RequestLevel) -> Self {
    self.lowest_permitted_request_level = level;
    self
  }

  /// Asks the pipeline to deliver intermediate (partial) results.
  pub fn with_progressive_rendering(mut self, enabled: bool) -> Self {
    self.progressive_rendering_enabled = enabled;
    self
  }

  pub fn source_uri(&self) -> &str {
    &self.source_uri
  }

  pub fn resize_options(&self) -> Option<ResizeOptions> {
    self.resize_options
  }

  pub fn rotation_options(&self) -> RotationOptions {
    self.rotation_options
  }

  pub fn lowest_permitted_request_level(&self) -> RequestLevel {
    self.lowest_permitted_request_level
  }

  pub fn progressive_rendering_enabled(&self) -> bool {
    self.progressive_rendering_enabled
  }
}

impl fmt::Debug for ImageRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ImageRequest")
      .field("uri", &self.source_uri)
      .field("resize", &self.resize_options)
      .field("rotation", &self.rotation_options)
      .field("lowest_level", &self.lowest_permitted_request_level)
      .finish_non_exhaustive()
  }
}

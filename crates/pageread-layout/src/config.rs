//! Fixed architecture constants for the layout detector.

/// One row of the backbone's stage table:
/// `(in, mid, out, num_blocks, downsample, light_block, kernel, num_layers)`.
#[derive(Debug, Clone, Copy)]
pub struct StageConfig {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
    pub num_blocks: usize,
    pub downsample: bool,
    pub light_block: bool,
    pub kernel: usize,
    pub num_layers: usize,
}

/// The four fixed backbone stages.
pub const BACKBONE_STAGES: [StageConfig; 4] = [
    StageConfig { in_channels: 48, mid_channels: 48, out_channels: 128, num_blocks: 1, downsample: false, light_block: false, kernel: 3, num_layers: 6 },
    StageConfig { in_channels: 128, mid_channels: 96, out_channels: 512, num_blocks: 1, downsample: true, light_block: false, kernel: 3, num_layers: 6 },
    StageConfig { in_channels: 512, mid_channels: 192, out_channels: 1024, num_blocks: 3, downsample: true, light_block: true, kernel: 5, num_layers: 6 },
    StageConfig { in_channels: 1024, mid_channels: 384, out_channels: 2048, num_blocks: 1, downsample: true, light_block: true, kernel: 5, num_layers: 6 },
];

#[derive(Debug, Clone)]
pub struct LayoutModelConfig {
    pub d_model: usize,
    pub num_queries: usize,
    pub num_classes: usize,
    pub num_decoder_layers: usize,
    pub num_heads: usize,
    pub num_levels: usize,
    pub num_points: usize,
    pub encoder_layers: usize,
    /// Index (0-based, among the three projected encoder features) that
    /// AIFI self-attention is applied at.
    pub encode_proj_layer: usize,
    pub mask_h: usize,
    pub mask_w: usize,
    pub global_pointer_head_size: usize,
    pub mask_enhanced: bool,
    pub ffn_dim: usize,
}

impl Default for LayoutModelConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            num_queries: 300,
            num_classes: 25,
            num_decoder_layers: 6,
            num_heads: 8,
            num_levels: 3,
            num_points: 4,
            encoder_layers: 1,
            encode_proj_layer: 2,
            mask_h: 200,
            mask_w: 200,
            global_pointer_head_size: 64,
            mask_enhanced: true,
            ffn_dim: 1024,
        }
    }
}

pub const INPUT_SIZE: usize = 800;

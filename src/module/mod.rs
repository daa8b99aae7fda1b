pub mod conv2d_norm;
pub mod inverted_residual;

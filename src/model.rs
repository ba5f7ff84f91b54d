use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    prelude::*,
    tensor::activation::log_softmax,
};

/// Channels produced by the second convolution.
const CONV2_CHANNELS: usize = 20;
/// Spatial size left after two `5x5` convolutions and two `2x2` poolings of a `28x28` image.
const FEATURE_SIZE: usize = 4;

/// Configuration to create a [ConvNet] using the [init function](ConvNetConfig::init).
#[derive(Config, Debug)]
pub struct ConvNetConfig {
    /// Number of output classes.
    #[config(default = 10)]
    pub num_classes: usize,
    /// Width of the hidden fully connected layer.
    #[config(default = 50)]
    pub hidden_size: usize,
    /// Dropout probability, used after the second convolution and the hidden layer.
    #[config(default = 0.5)]
    pub dropout: f64,
}

/// Two convolution blocks followed by two linear layers.
///
/// The output is a tensor of log-probabilities of shape `[batch_size, num_classes]`.
/// Dropout is only active on autodiff backends, so the [valid](burn::module::AutodiffModule::valid)
/// copy of a trained model is the evaluation-mode model.
#[derive(Module, Debug)]
pub struct ConvNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv_dropout: Dropout,
    pool: MaxPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl ConvNetConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNet<B> {
        ConvNet {
            conv1: Conv2dConfig::new([1, 10], [5, 5]).init(device),
            conv2: Conv2dConfig::new([10, CONV2_CHANNELS], [5, 5]).init(device),
            conv_dropout: DropoutConfig::new(self.dropout).init(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(
                CONV2_CHANNELS * FEATURE_SIZE * FEATURE_SIZE,
                self.hidden_size,
            )
            .init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> ConvNet<B> {
    /// # Shapes
    ///   - Images [batch_size, height, width]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, height, width] = images.dims();

        // Create a channel at the second dimension.
        let x = images.reshape([batch_size, 1, height, width]);

        let x = self.conv1.forward(x); // [batch_size, 10, 24, 24]
        let x = self.pool.forward(x); // [batch_size, 10, 12, 12]
        let x = self.activation.forward(x);

        let x = self.conv2.forward(x); // [batch_size, 20, 8, 8]
        let x = self.conv_dropout.forward(x);
        let x = self.pool.forward(x); // [batch_size, 20, 4, 4]
        let x = self.activation.forward(x);

        let x = x.reshape([batch_size, CONV2_CHANNELS * FEATURE_SIZE * FEATURE_SIZE]);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        let x = self.fc2.forward(x);

        log_softmax(x, 1)
    }
}

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::{config::Monitor, data::SIDE};

const FILTERS: [usize; 3] = [32, 64, 128];

#[derive(Config, Debug)]
pub struct EmotionCnnConfig {
    num_classes: usize,
    #[config(default = 1)]
    input_channels: usize,
    #[config(default = 0.25)]
    dropout: f64,
}

impl EmotionCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmotionCnn<B> {
        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        // Three 2×2 pools shrink 48 to 6.
        let side = SIDE >> FILTERS.len();

        EmotionCnn {
            conv1: conv([self.input_channels, FILTERS[0]]),
            conv2: conv([FILTERS[0], FILTERS[1]]),
            conv3: conv([FILTERS[1], FILTERS[2]]),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(FILTERS[2] * side * side, 256).init(device),
            fc2: LinearConfig::new(256, self.num_classes).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct EmotionCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
    relu: Relu,
}

impl<B: Backend> EmotionCnn<B> {
    /// `[batch, 1, 48, 48]` → `[batch, num_classes]` logits.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(self.relu.forward(self.conv1.forward(x)));
        let x = self.pool.forward(self.relu.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.relu.forward(self.conv3.forward(x)));

        let [batch_size, channels, height, width] = x.dims();
        let x = x.reshape([batch_size, channels * height * width]);

        let x = self.fc1.forward(x);
        let x = self.relu.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }
}

/// Schedule shared by all four CNN runs; saved as JSON next to each checkpoint.
#[derive(Config, Debug)]
pub struct NeuralTrainingConfig {
    #[config(default = 100)]
    pub epochs: usize,
    #[config(default = 50)]
    pub steps_per_epoch: usize,
    #[config(default = 100)]
    pub validation_steps: usize,
    /// Validation batches scored after the best model is reloaded.
    #[config(default = 5)]
    pub eval_steps: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Epochs without a training-loss improvement before stopping.
    #[config(default = 2)]
    pub patience: usize,
    #[config(default = 0.0)]
    pub min_delta: f64,
    #[config(default = 99)]
    pub seed: u64,
    #[config(default = "Monitor::ValidationAccuracy")]
    pub monitor: Monitor,
    #[config(default = false)]
    pub horizontal_flip: bool,
}

use cpal::{
    FromSample, SampleFormat, SizedSample,
    traits::{DeviceTrait, HostTrait},
};

use crate::AudioError;

/// The default output device and the configuration streams are opened with.
pub(crate) struct OutputDevice {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
}

impl OutputDevice {
    pub(crate) fn open_default() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let supported = device.default_output_config()?;
        if let Ok(name) = device.name() {
            log::info!(
                "output device '{name}': {} Hz, {} channels, {}",
                supported.sample_rate().0,
                supported.channels(),
                supported.sample_format()
            );
        }
        Ok(Self {
            device,
            sample_format: supported.sample_format(),
            config: supported.into(),
        })
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub(crate) fn channels(&self) -> u16 {
        self.config.channels
    }
}

/// Open a paused output stream that pulls f32 samples from `render`.
pub(crate) fn build_output<F>(output: &OutputDevice, render: F) -> Result<cpal::Stream, AudioError>
where
    F: FnMut(&mut [f32]) + Send + 'static,
{
    let stream = match output.sample_format {
        SampleFormat::F32 => build_stream::<f32, F>(&output.device, &output.config, render)?,
        SampleFormat::I16 => build_stream::<i16, F>(&output.device, &output.config, render)?,
        SampleFormat::U16 => build_stream::<u16, F>(&output.device, &output.config, render)?,
        sample_format => return Err(AudioError::UnsupportedFormat(sample_format.to_string())),
    };
    Ok(stream)
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: F,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
    F: FnMut(&mut [f32]) + Send + 'static,
{
    let mut scratch = vec![0.0f32; 8192];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if scratch.len() < data.len() {
                scratch.resize(data.len(), 0.0);
            }
            let block = &mut scratch[..data.len()];
            render(block);
            for (out, sample) in data.iter_mut().zip(block.iter()) {
                *out = T::from_sample(*sample);
            }
        },
        |err| log::error!("output stream error: {err}"),
        None,
    )?;

    Ok(stream)
}

use crate::canvas::{Canvas, Color, Rect};

/// Items drawn by the preview loop when no timeline is set.
#[derive(Clone)]
pub enum Drawable {
    RotatingRect(RotatingRect),
}

impl Drawable {
    pub fn rotating_rect(width: f32, height: f32, speed_deg_per_sec: f32, color: Color) -> Self {
        Drawable::RotatingRect(RotatingRect {
            width,
            height,
            speed_deg_per_sec,
            color,
            angle_degrees: 0.0,
        })
    }

    pub fn update(&mut self, dt_sec: f32) {
        match self {
            Drawable::RotatingRect(rect) => rect.update(dt_sec),
        }
    }

    pub fn draw(&self, canvas: &mut Canvas) {
        match self {
            Drawable::RotatingRect(rect) => rect.draw(canvas),
        }
    }
}

/// A solid rectangle spinning about the canvas center.
#[derive(Clone)]
pub struct RotatingRect {
    width: f32,
    height: f32,
    speed_deg_per_sec: f32,
    color: Color,
    angle_degrees: f32,
}

impl RotatingRect {
    fn update(&mut self, dt_sec: f32) {
        self.angle_degrees = (self.angle_degrees + self.speed_deg_per_sec * dt_sec) % 360.0;
    }

    fn draw(&self, canvas: &mut Canvas) {
        let center_x = canvas.width() as f32 * 0.5;
        let center_y = canvas.height() as f32 * 0.5;
        let dst = Rect::from_xywh(
            center_x - self.width * 0.5,
            center_y - self.height * 0.5,
            self.width,
            self.height,
        );
        canvas.fill_rect(dst, self.angle_degrees, self.color);
    }
}

#[cfg(test)]
mod tests {
    use super::Drawable;
    use crate::canvas::{Canvas, Color, DrawCmd};

    #[test]
    fn rotation_accumulates_and_wraps() {
        let mut drawable = Drawable::rotating_rect(100.0, 120.0, 90.0, Color::RED);
        for _ in 0..5 {
            drawable.update(1.0);
        }
        let mut canvas = Canvas::new(200, 200);
        drawable.draw(&mut canvas);
        let DrawCmd::FillRect {
            rotation_degrees, ..
        } = canvas.commands()[0]
        else {
            panic!("expected rect draw");
        };
        // 5s at 90 deg/s wraps once.
        assert!((rotation_degrees - 90.0).abs() < 1e-4);
    }

    #[test]
    fn rect_is_centered_on_the_canvas() {
        let drawable = Drawable::rotating_rect(100.0, 120.0, 90.0, Color::RED);
        let mut canvas = Canvas::new(400, 300);
        drawable.draw(&mut canvas);
        let DrawCmd::FillRect { dst, .. } = canvas.commands()[0] else {
            panic!("expected rect draw");
        };
        assert_eq!(dst.x + dst.w * 0.5, 200.0);
        assert_eq!(dst.y + dst.h * 0.5, 150.0);
    }
}
